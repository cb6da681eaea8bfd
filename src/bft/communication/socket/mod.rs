//! Abstracts over the async TCP backend selected at compile time via
//! the `socket_*_tcp` feature flags.

#[cfg(feature = "socket_tokio_tcp")]
mod tokio_tcp;

#[cfg(feature = "socket_tokio_tcp")]
use self::tokio_tcp as backend;

#[cfg(feature = "socket_async_std_tcp")]
mod async_std_tcp;

#[cfg(feature = "socket_async_std_tcp")]
use self::async_std_tcp as backend;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_tls::{client::TlsStream as TlsStreamCli, server::TlsStream as TlsStreamSrv};
use futures::io::{AsyncRead, AsyncWrite};

/// A listening TCP socket, accepting connections from peer replicas
/// and clients.
pub struct Listener {
    inner: backend::Listener,
}

/// An established TCP connection to a peer replica or client.
pub struct Socket {
    inner: backend::Socket,
}

/// Creates a new `Listener` bound to the address `addr`.
pub async fn bind<A: Into<SocketAddr>>(addr: A) -> io::Result<Listener> {
    backend::bind(addr.into()).await.map(|inner| Listener { inner })
}

/// Connects to the remote process with address `addr`.
pub async fn connect<A: Into<SocketAddr>>(addr: A) -> io::Result<Socket> {
    backend::connect(addr.into()).await.map(|inner| Socket { inner })
}

impl Listener {
    /// Accepts a new connection over this `Listener`.
    pub async fn accept(&self) -> io::Result<Socket> {
        self.inner.accept().await.map(|inner| Socket { inner })
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

/// A connection handed off to the dispatcher once the inbound TLS
/// handshake has completed, read-only from this point on: the
/// dispatcher's rx loop decodes wire frames off of it.
pub enum SecureSocketRecv {
    Tls(TlsStreamSrv<Socket>),
}

/// A connection handed off to the dispatcher once the outbound TLS
/// handshake has completed, write-only: `Node::send`/`broadcast` write
/// framed messages to it.
pub enum SecureSocketSend {
    Tls(TlsStreamCli<Socket>),
}

impl AsyncRead for SecureSocketRecv {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SecureSocketRecv::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SecureSocketSend {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SecureSocketSend::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureSocketSend::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureSocketSend::Tls(s) => Pin::new(s).poll_close(cx),
        }
    }
}
