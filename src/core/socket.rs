use socket2::{Domain, Protocol, Socket, Type};
use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::errors::ServerError;

/// Bind and listen the server socket. Must run inside a tokio runtime.
pub(crate) fn bind_listener(
    bind_address: &str,
    port: u16,
    config: &ServerConfig,
) -> Result<TcpListener, ServerError> {
    let ip: IpAddr = bind_address
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind_address.to_string()))?;
    let address = SocketAddr::new(ip, port);
    let bind_err = |source| ServerError::Bind {
        addr: address,
        source,
    };

    let socket = if ip.is_ipv4() {
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
    } else {
        Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))
    }
    .map_err(bind_err)?;

    // TCP tuning
    socket.set_tcp_nodelay(config.nodelay).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;

    // set keepalive with 60s interval
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
    socket.set_keepalive(true).map_err(bind_err)?;
    socket.set_tcp_keepalive(&keepalive).map_err(bind_err)?;

    // Linux-specific optimizations, best effort
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = socket.as_raw_fd();

        // Enable TCP_QUICKACK
        unsafe {
            let enable: libc::c_int = 1;
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_QUICKACK,
                &enable as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&address.into()).map_err(bind_err)?;

    socket
        .listen(config.backlog)
        .map_err(|source| ServerError::Listen {
            addr: address,
            source,
        })?;

    Ok(TcpListener::from_std(std::net::TcpListener::from(socket))?)
}
