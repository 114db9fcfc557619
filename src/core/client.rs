use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use socket2::SockRef;
use tokio::net::TcpStream;

/// Engine-assigned client identifier. Starts at 1 and is never reused.
pub type ClientId = u64;

/// An accepted TCP connection.
///
/// The stream is shared by the receive and send paths through readiness
/// polling, so neither needs exclusive access to it.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    open: AtomicBool,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            open: AtomicBool::new(true),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// False once the engine has disconnected this connection.
    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Shut down both directions. Pending reads complete with zero bytes.
    pub fn shutdown(&self) -> io::Result<()> {
        match SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            res => res,
        }
    }

    /// Mark the connection as gone. The socket itself closes when the last
    /// handle to the owning client is dropped.
    pub(crate) fn disconnect(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub(crate) fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    pub(crate) async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(buf) {
                Err(e) if is_retry(&e) => continue,
                res => return res,
            }
        }
    }

    pub(crate) fn try_write(&self, data: &[u8]) -> io::Result<usize> {
        self.stream.try_write(data)
    }

    pub(crate) async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if is_retry(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("open", &self.is_connected())
            .finish()
    }
}

#[inline]
pub(crate) fn is_retry(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Application-visible handle for one accepted connection.
///
/// Implement this to carry per-connection application state; the engine
/// builds instances through a [`ClientFactory`].
pub trait Client: Send + Sync + 'static {
    fn id(&self) -> ClientId;
    fn connection(&self) -> &Connection;
}

/// Client with no state beyond its id and connection.
#[derive(Debug)]
pub struct BasicClient {
    id: ClientId,
    connection: Connection,
}

impl BasicClient {
    pub fn new(id: ClientId, connection: Connection) -> Self {
        Self { id, connection }
    }
}

impl Client for BasicClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn connection(&self) -> &Connection {
        &self.connection
    }
}

/// Builds the concrete client type for each accepted connection.
pub trait ClientFactory<C>: Send + 'static {
    fn create(&self, id: ClientId, connection: Connection) -> C;
}

impl<C, F> ClientFactory<C> for F
where
    F: Fn(ClientId, Connection) -> C + Send + 'static,
{
    fn create(&self, id: ClientId, connection: Connection) -> C {
        self(id, connection)
    }
}
