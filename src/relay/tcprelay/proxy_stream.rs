//! Client-side stream for reaching a destination through the proxy
//!
//! The destination address header is queued lazily on construction, so it
//! goes out coalesced with the first payload chunk. For protocols where the
//! server speaks first, flushing pushes the header on its own.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{self, Poll},
};

use bytes::BytesMut;
use log::trace;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use super::crypto_io::CryptoStream;
use crate::{config::AccessKey, relay::socks5::Address};

/// A stream for sending / receiving data to a destination through a
/// shadowsocks proxy server
pub struct ProxyClientStream<S> {
    stream: CryptoStream<S>,
}

impl ProxyClientStream<TcpStream> {
    /// Connects to the proxy at `server_addr` and targets `addr` with the
    /// given access key
    pub async fn connect<A>(server_addr: SocketAddr, key: &AccessKey, addr: A) -> io::Result<ProxyClientStream<TcpStream>>
    where
        A: Into<Address>,
    {
        let stream = TcpStream::connect(server_addr).await?;
        trace!("connected proxy server {}", server_addr);
        Ok(ProxyClientStream::from_stream(stream, key, addr))
    }
}

impl<S> ProxyClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream already connected to the proxy server
    pub fn from_stream<A>(stream: S, key: &AccessKey, addr: A) -> ProxyClientStream<S>
    where
        A: Into<Address>,
    {
        let mut stream = CryptoStream::from_stream(stream, key.method(), key.key());

        let addr = addr.into();
        let mut buf = BytesMut::with_capacity(addr.serialized_len());
        addr.write_to_buf(&mut buf);
        stream.lazy_write(&buf);

        ProxyClientStream { stream }
    }

    /// Consumes the object and returns the underlying stream
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

impl<S> AsyncRead for ProxyClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for ProxyClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    #[inline]
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
