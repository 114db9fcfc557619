//! The serialized execution context.
//!
//! One task owns the connection registry, the event queue and the receive
//! context pool. Application commands and I/O completions reach it as
//! messages on a single unbounded mailbox, so every mutation of shared state
//! happens on this task and none of it needs a lock.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use smallvec::SmallVec;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::ServerConfig;
use crate::core::client::{is_retry, Client, ClientFactory, ClientId, Connection};
use crate::core::context::{ContextPool, IoContext, WriteOp};
use crate::core::event::{Event, EventItem, EventQueue};
use crate::errors::{PoolError, ServerError};
use crate::memory::Pool;

pub(crate) type Mailbox<C> = mpsc::UnboundedSender<Message<C>>;
pub(crate) type Inbox<C> = mpsc::UnboundedReceiver<Message<C>>;
pub(crate) type Subscriber<C> = mpsc::UnboundedSender<EventItem<C>>;

pub(crate) enum Message<C> {
    Command(Command<C>),
    Completion(Completion<C>),
}

/// Requests from the application side.
pub(crate) enum Command<C> {
    Send {
        id: ClientId,
        data: Bytes,
    },
    GetClient {
        id: ClientId,
        reply: oneshot::Sender<Option<Arc<C>>>,
    },
    Subscribe {
        subscriber: Subscriber<C>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Results of I/O performed away from the engine task.
pub(crate) enum Completion<C> {
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
    },
    Received {
        ctx: IoContext<C>,
        result: io::Result<usize>,
    },
    Written {
        client: Arc<C>,
        data: Bytes,
        result: io::Result<()>,
    },
    AcceptFailed {
        error: io::Error,
        backoff: Duration,
    },
}

/// Registry entry. Writes to one client go out one at a time so their bytes
/// never interleave on the wire.
struct Entry<C> {
    client: Arc<C>,
    writing: bool,
    queued: VecDeque<WriteOp<C>>,
}

impl<C> Entry<C> {
    fn new(client: Arc<C>) -> Self {
        Self {
            client,
            writing: false,
            queued: VecDeque::new(),
        }
    }
}

pub(crate) struct Engine<C, F> {
    config: ServerConfig,
    factory: F,
    mailbox: Mailbox<C>,
    inbox: Inbox<C>,
    clients: HashMap<ClientId, Entry<C>, RandomState>,
    events: EventQueue<C>,
    subscribers: SmallVec<[Subscriber<C>; 2]>,
    contexts: ContextPool<C>,
    next_client_id: ClientId,
    acceptor: JoinHandle<()>,
    stopping: bool,
    fault: Option<PoolError>,
    stop_replies: Vec<oneshot::Sender<()>>,
}

impl<C, F> Engine<C, F>
where
    C: Client,
    F: ClientFactory<C>,
{
    pub(crate) fn new(
        config: ServerConfig,
        factory: F,
        mailbox: Mailbox<C>,
        inbox: Inbox<C>,
        contexts: ContextPool<C>,
        acceptor: JoinHandle<()>,
    ) -> Self {
        Self {
            clients: HashMap::with_capacity_and_hasher(config.context_count, RandomState::new()),
            config,
            factory,
            mailbox,
            inbox,
            events: EventQueue::new(),
            subscribers: SmallVec::new(),
            contexts,
            next_client_id: 1,
            acceptor,
            stopping: false,
            fault: None,
            stop_replies: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = time::interval(self.config.drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                _ = ticker.tick() => self.drain(),
            }

            if self.stopping && self.clients.is_empty() {
                break;
            }
        }

        self.finish();
    }

    fn handle(&mut self, message: Message<C>) {
        match message {
            Message::Command(command) => self.on_command(command),
            Message::Completion(completion) => self.on_completion(completion),
        }
    }

    fn on_command(&mut self, command: Command<C>) {
        match command {
            Command::Send { id, data } => self.send(id, data),
            Command::GetClient { id, reply } => {
                let client = self.clients.get(&id).map(|entry| entry.client.clone());
                let _ = reply.send(client);
            }
            Command::Subscribe { subscriber } => {
                // Flush first so the new subscriber only sees what comes next.
                self.drain();
                self.subscribers.push(subscriber);
            }
            Command::Shutdown { reply } => {
                self.stop_replies.extend(reply);
                self.stop();
            }
        }
    }

    fn on_completion(&mut self, completion: Completion<C>) {
        match completion {
            Completion::Accepted { stream, peer } => {
                if let Err(err) = self.on_accepted(stream, peer) {
                    error!("Cannot serve connection from {}: {}", peer, err);
                    if self.fault.is_none() {
                        self.fault = Some(err);
                    }
                    self.stop();
                }
            }
            Completion::Received { ctx, result } => self.on_received(ctx, result),
            Completion::Written {
                client,
                data,
                result,
            } => self.on_written(client, data, result),
            Completion::AcceptFailed { error, backoff } => {
                warn!("Accept failed, retrying in {:?}: {}", backoff, error);
            }
        }
    }

    fn on_accepted(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<(), PoolError> {
        if self.stopping {
            trace!("Dropping connection from {} during shutdown", peer);
            return Ok(());
        }
        if self.config.nodelay {
            let _ = stream.set_nodelay(true);
        }

        let id = self.next_client_id;
        self.next_client_id += 1;

        let mut ctx = self.contexts.acquire()?;
        let client = Arc::new(self.factory.create(id, Connection::new(stream, peer)));
        ctx.bind(client.clone());
        self.clients.insert(id, Entry::new(client.clone()));
        self.start_receive(ctx);

        debug!("Client {} connected from {}", id, peer);
        self.events.publish(Event::Connected(client));
        Ok(())
    }

    /// Arm a receive. A read that completes right away is still posted back
    /// through the mailbox rather than handled recursively.
    fn start_receive(&mut self, mut ctx: IoContext<C>) {
        match ctx.try_receive() {
            Err(e) if is_retry(&e) => {
                tokio::spawn(async move {
                    let result = ctx.receive().await;
                    ctx.complete(result);
                });
            }
            result => ctx.complete(result),
        }
    }

    fn on_received(&mut self, ctx: IoContext<C>, result: io::Result<usize>) {
        let Some(client) = ctx.client().cloned() else {
            self.contexts.release(ctx);
            return;
        };

        match result {
            Ok(count) if count > 0 => {
                let data = ctx
                    .segment()
                    .map(|segment| Bytes::copy_from_slice(&segment[..count]))
                    .unwrap_or_default();
                trace!("Client {} received {} bytes", client.id(), count);
                self.events.publish(Event::DataReceived {
                    client,
                    data,
                    count,
                });
                if self.stopping {
                    self.disconnect(ctx);
                } else {
                    self.start_receive(ctx);
                }
            }
            Ok(_) => self.disconnect(ctx),
            Err(err) => {
                debug!("Client {} read failed: {}", client.id(), err);
                self.disconnect(ctx);
            }
        }
    }

    /// The one teardown path, reached from a zero-length read or a failed
    /// read. The receive context is unique per client, so this runs once.
    fn disconnect(&mut self, ctx: IoContext<C>) {
        let Some(client) = ctx.client().cloned() else {
            self.contexts.release(ctx);
            return;
        };

        let connection = client.connection();
        if let Err(err) = connection.shutdown() {
            trace!("Client {} shutdown: {}", client.id(), err);
        }
        if connection.is_connected() {
            connection.disconnect();
        }

        let removed = self.clients.remove(&client.id());
        self.contexts.release(ctx);

        if removed.is_some() {
            debug!("Client {} disconnected", client.id());
            self.events.publish(Event::Disconnected(client));
        }
    }

    fn send(&mut self, id: ClientId, data: Bytes) {
        let Some(entry) = self.clients.get_mut(&id) else {
            trace!("Ignoring send to unknown client {}", id);
            return;
        };
        if !entry.client.connection().is_connected() {
            return;
        }

        let op = WriteOp::new(entry.client.clone(), data);
        if entry.writing {
            entry.queued.push_back(op);
        } else {
            entry.writing = true;
            op.start(&self.mailbox);
        }
    }

    fn on_written(&mut self, client: Arc<C>, data: Bytes, result: io::Result<()>) {
        // Already torn down: Disconnected was the last word for this client.
        let Some(entry) = self.clients.get_mut(&client.id()) else {
            return;
        };

        match result {
            Ok(()) => {
                self.events.publish(Event::Sent { client, data });
                match entry.queued.pop_front() {
                    Some(next) => next.start(&self.mailbox),
                    None => entry.writing = false,
                }
            }
            Err(err) => {
                // Let the pending receive observe the shutdown and tear down.
                debug!("Client {} write failed: {}", client.id(), err);
                entry.queued.clear();
                entry.writing = false;
                let _ = client.connection().shutdown();
            }
        }
    }

    /// Forward every queued event to every live subscriber.
    fn drain(&mut self) {
        if self.events.is_empty() {
            return;
        }
        let subscribers = &mut self.subscribers;
        for event in self.events.drain() {
            subscribers.retain(|subscriber| subscriber.send(Ok(event.clone())).is_ok());
        }
    }

    fn stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        self.acceptor.abort();
        info!("Stopping server, closing {} connections", self.clients.len());
        for entry in self.clients.values() {
            let _ = entry.client.connection().shutdown();
        }
    }

    fn finish(mut self) {
        self.acceptor.abort();
        self.drain();
        if let Some(fault) = self.fault.take() {
            for subscriber in self.subscribers.drain(..) {
                let _ = subscriber.send(Err(ServerError::Capacity(fault.clone())));
            }
        }
        self.subscribers.clear();
        for reply in self.stop_replies.drain(..) {
            let _ = reply.send(());
        }
        info!("Server stopped");
    }
}

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Source of accepted connections for [`accept_loop`].
pub(crate) trait Accept: Send + 'static {
    fn next_conn(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn next_conn(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Errors that concern one half-open connection rather than the listener.
fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Accept loop. Owns the listener and forwards every accepted stream to the
/// engine, independently of any receive in progress.
///
/// Listener-level failures such as `EMFILE` are reported to the engine and
/// retried after an exponential pause, reset by the next successful accept.
pub(crate) async fn accept_loop<A: Accept, C>(mut listener: A, mailbox: Mailbox<C>) {
    let mut backoff = ACCEPT_BACKOFF_MIN;
    loop {
        let message = match listener.next_conn().await {
            Ok((stream, peer)) => {
                backoff = ACCEPT_BACKOFF_MIN;
                Completion::Accepted { stream, peer }
            }
            Err(err) if is_connection_error(&err) => {
                trace!("Accepted connection dropped before use: {}", err);
                continue;
            }
            Err(error) => Completion::AcceptFailed { error, backoff },
        };

        let failed = matches!(message, Completion::AcceptFailed { .. });
        if mailbox.send(Message::Completion(message)).is_err() {
            break;
        }
        if failed {
            time::sleep(backoff).await;
            backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::BasicClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Listener whose every accept fails like a process out of descriptors.
    struct Exhausted {
        attempts: Arc<AtomicUsize>,
    }

    impl Accept for Exhausted {
        fn next_conn(
            &mut self,
        ) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(io::Error::from_raw_os_error(libc::EMFILE)))
        }
    }

    /// Listener that only yields connection-scoped errors.
    struct Resetting {
        attempts: Arc<AtomicUsize>,
        limit: usize,
    }

    impl Accept for Resetting {
        fn next_conn(
            &mut self,
        ) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            let done = n >= self.limit;
            async move {
                if done {
                    std::future::pending::<()>().await;
                }
                Err::<(TcpStream, SocketAddr), _>(io::Error::from(io::ErrorKind::ConnectionAborted))
            }
        }
    }

    #[tokio::test]
    async fn persistent_accept_errors_back_off() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (mailbox, mut inbox) = mpsc::unbounded_channel::<Message<BasicClient>>();
        let acceptor = tokio::spawn(accept_loop(
            Exhausted {
                attempts: attempts.clone(),
            },
            mailbox,
        ));

        time::sleep(Duration::from_millis(200)).await;
        acceptor.abort();

        // 5 + 10 + 20 + 40 + 80 ms of pauses fit in the window.
        let tried = attempts.load(Ordering::SeqCst);
        assert!((1..=8).contains(&tried), "{} accept attempts", tried);

        let mut reported = Vec::new();
        while let Ok(message) = inbox.try_recv() {
            match message {
                Message::Completion(Completion::AcceptFailed { error, backoff }) => {
                    assert_eq!(error.raw_os_error(), Some(libc::EMFILE));
                    reported.push(backoff);
                }
                _ => panic!("unexpected message"),
            }
        }
        assert_eq!(reported.len(), tried);
        assert_eq!(reported.first(), Some(&ACCEPT_BACKOFF_MIN));
        assert!(reported.windows(2).all(|w| w[1] == w[0] * 2));
    }

    #[tokio::test]
    async fn connection_errors_are_skipped_without_reporting() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (mailbox, mut inbox) = mpsc::unbounded_channel::<Message<BasicClient>>();
        let acceptor = tokio::spawn(accept_loop(
            Resetting {
                attempts: attempts.clone(),
                limit: 3,
            },
            mailbox,
        ));

        time::sleep(Duration::from_millis(50)).await;
        acceptor.abort();

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn accept_loop_stops_once_engine_is_gone() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (mailbox, inbox) = mpsc::unbounded_channel::<Message<BasicClient>>();
        drop(inbox);

        let acceptor = tokio::spawn(accept_loop(
            Exhausted {
                attempts: attempts.clone(),
            },
            mailbox,
        ));
        time::timeout(Duration::from_secs(1), acceptor)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
