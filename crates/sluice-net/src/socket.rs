//! Socket construction with the engine's option set.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::NetError;

/// Builds a listening socket with `SO_REUSEADDR`, optional
/// `SO_REUSEPORT` (the load-balancing variant on FreeBSD) and optional
/// transparent proxying (`IP_TRANSPARENT`, Linux only; elsewhere the
/// request is logged and ignored).
pub(crate) fn bind_listener(
    addr: SocketAddr,
    reuse_port: bool,
    transparent: bool,
) -> Result<tokio::net::TcpListener, NetError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| NetError::Bind { addr, source })?;

    socket
        .set_reuse_address(true)
        .map_err(|source| NetError::SocketOption { option: "SO_REUSEADDR", source })?;

    if transparent {
        set_transparent(&socket)?;
    }

    if reuse_port {
        set_reuse_port(&socket)?;
    }

    socket
        .bind(&addr.into())
        .map_err(|source| NetError::Bind { addr, source })?;
    socket
        .listen(1024)
        .map_err(|source| NetError::Bind { addr, source })?;
    socket
        .set_nonblocking(true)
        .map_err(|source| NetError::Bind { addr, source })?;

    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener)
        .map_err(|source| NetError::Bind { addr, source })
}

#[cfg(target_os = "linux")]
fn set_transparent(socket: &Socket) -> Result<(), NetError> {
    socket
        .set_ip_transparent(true)
        .map_err(|source| NetError::SocketOption { option: "IP_TRANSPARENT", source })
}

#[cfg(not(target_os = "linux"))]
fn set_transparent(_socket: &Socket) -> Result<(), NetError> {
    tracing::warn!("transparent proxying requires Linux; option ignored");
    Ok(())
}

#[cfg(target_os = "freebsd")]
fn set_reuse_port(socket: &Socket) -> Result<(), NetError> {
    socket
        .set_reuse_port_lb(true)
        .map_err(|source| NetError::SocketOption { option: "SO_REUSEPORT_LB", source })
}

#[cfg(all(unix, not(target_os = "freebsd")))]
fn set_reuse_port(socket: &Socket) -> Result<(), NetError> {
    socket
        .set_reuse_port(true)
        .map_err(|source| NetError::SocketOption { option: "SO_REUSEPORT", source })
}

#[cfg(not(unix))]
fn set_reuse_port(_socket: &Socket) -> Result<(), NetError> {
    tracing::warn!("SO_REUSEPORT is not available on this platform; option ignored");
    Ok(())
}
