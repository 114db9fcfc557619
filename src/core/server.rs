use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use log::info;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::config::ServerConfig;
use crate::core::client::{BasicClient, Client, ClientFactory, ClientId, Connection};
use crate::core::context::context_pool;
use crate::core::engine::{accept_loop, Command, Engine, Mailbox, Message};
use crate::core::event::EventStream;
use crate::core::socket::bind_listener;
use crate::errors::ServerError;

type BasicFactory = fn(ClientId, Connection) -> BasicClient;

/// Configures and starts a [`Server`].
pub struct ServerBuilder<C, F> {
    config: ServerConfig,
    factory: F,
    _client: PhantomData<fn() -> C>,
}

impl ServerBuilder<BasicClient, BasicFactory> {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            factory: BasicClient::new,
            _client: PhantomData,
        }
    }
}

impl Default for ServerBuilder<BasicClient, BasicFactory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, F> ServerBuilder<C, F> {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the factory that turns accepted connections into clients.
    pub fn client_factory<C2, F2>(self, factory: F2) -> ServerBuilder<C2, F2>
    where
        F2: ClientFactory<C2>,
    {
        ServerBuilder {
            config: self.config,
            factory,
            _client: PhantomData,
        }
    }
}

impl<C, F> ServerBuilder<C, F>
where
    C: Client,
    F: ClientFactory<C>,
{
    /// Bind, listen, and start accepting on the current tokio runtime.
    ///
    /// Bind and listen failures are returned as is; there is no retry.
    pub fn start(self, bind_address: &str, port: u16) -> Result<Server<C>, ServerError> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| ServerError::NoRuntime)?;

        let listener = bind_listener(bind_address, port, &self.config)?;
        let local_addr = listener.local_addr()?;

        let (mailbox, inbox) = mpsc::unbounded_channel();
        let contexts = context_pool(
            self.config.context_count,
            self.config.buffer_size,
            mailbox.clone(),
        )?;
        let acceptor = runtime.spawn(accept_loop(listener, mailbox.clone()));
        let engine = Engine::new(
            self.config,
            self.factory,
            mailbox.clone(),
            inbox,
            contexts,
            acceptor,
        );
        runtime.spawn(engine.run());

        info!("Listening on {}", local_addr);
        Ok(Server {
            inner: Arc::new(Inner {
                mailbox,
                local_addr,
            }),
        })
    }
}

struct Inner<C> {
    mailbox: Mailbox<C>,
    local_addr: SocketAddr,
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        let _ = self
            .mailbox
            .send(Message::Command(Command::Shutdown { reply: None }));
    }
}

/// Handle to a running server. Clones share the same engine; dropping the
/// last one shuts it down.
pub struct Server<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Server<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Server<BasicClient> {
    pub fn builder() -> ServerBuilder<BasicClient, BasicFactory> {
        ServerBuilder::new()
    }

    /// Start a server with [`BasicClient`] clients.
    pub fn start(
        config: ServerConfig,
        bind_address: &str,
        port: u16,
    ) -> Result<Self, ServerError> {
        ServerBuilder::new().config(config).start(bind_address, port)
    }
}

impl<C: Client> Server<C> {
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Queue a write to `id`. Unknown or already disconnected ids are ignored.
    pub fn send(&self, id: ClientId, data: impl Into<Bytes>) {
        let data = data.into();
        let _ = self
            .inner
            .mailbox
            .send(Message::Command(Command::Send { id, data }));
    }

    pub fn send_to(&self, client: &C, data: impl Into<Bytes>) {
        self.send(client.id(), data);
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> EventStream<C> {
        let (subscriber, receiver) = mpsc::unbounded_channel();
        let _ = self
            .inner
            .mailbox
            .send(Message::Command(Command::Subscribe { subscriber }));
        EventStream::new(receiver)
    }

    /// Look up a live client. `None` once it has disconnected.
    pub async fn get_client(&self, id: ClientId) -> Option<Arc<C>> {
        let (reply, response) = oneshot::channel();
        self.inner
            .mailbox
            .send(Message::Command(Command::GetClient { id, reply }))
            .ok()?;
        response.await.ok().flatten()
    }

    /// Stop accepting, disconnect every client, and wait for the engine to
    /// flush its last events.
    ///
    /// Fails with [`ServerError::Closed`] when the engine had already
    /// stopped, either from an earlier shutdown or a fatal fault.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        let (reply, done) = oneshot::channel();
        let command = Command::Shutdown { reply: Some(reply) };
        self.inner
            .mailbox
            .send(Message::Command(command))
            .map_err(|_| ServerError::Closed)?;
        done.await.map_err(|_| ServerError::Closed)
    }
}
