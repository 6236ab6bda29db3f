use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
};

use monoio::{
    io::{stream::Stream, AsyncReadRent, AsyncWriteRent},
    net::{ListenerOpts, TcpListener, TcpStream},
};

use crate::metrics::ConnectionHandle;

/// A bidirectional stream a session can run over.
pub trait SessionStream: AsyncReadRent + AsyncWriteRent {
    fn connection_handle(&self) -> ConnectionHandle;

    /// Disable Nagle-style coalescing where the transport has it.
    fn set_nodelay(&self, _nodelay: bool) -> io::Result<()> {
        Ok(())
    }
}

impl SessionStream for TcpStream {
    #[cfg(unix)]
    fn connection_handle(&self) -> ConnectionHandle {
        use std::os::fd::AsRawFd;
        self.as_raw_fd() as ConnectionHandle
    }

    #[cfg(not(unix))]
    fn connection_handle(&self) -> ConnectionHandle {
        -1
    }

    #[inline]
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }
}

/// TCP listener yielding accepted connections with their peer address.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind `port` on all local IPv4 addresses.
    pub fn bind(port: u16) -> io::Result<Self> {
        Self::bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    /// Bind `port` on all local IPv4 addresses with `SO_REUSEPORT`, so
    /// listeners on several threads share it.
    pub fn bind_reuse_port(port: u16) -> io::Result<Self> {
        Self::bind_with_config(
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            &ListenerOpts::default().reuse_port(true),
        )
    }

    pub fn bind_addr(addr: SocketAddr) -> io::Result<Self> {
        Self::bind_with_config(addr, &ListenerOpts::default())
    }

    pub fn bind_with_config(addr: SocketAddr, opts: &ListenerOpts) -> io::Result<Self> {
        TcpListener::bind_with_config(addr, opts).map(|inner| Self { inner })
    }

    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl Stream for Listener {
    type Item = io::Result<(TcpStream, SocketAddr)>;

    async fn next(&mut self) -> Option<Self::Item> {
        Some(self.inner.accept().await)
    }
}
