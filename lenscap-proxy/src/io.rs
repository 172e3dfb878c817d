//! Stream wrapper that replays bytes already pulled off a socket before
//! handing the socket to the next protocol layer (e.g. a TLS handshake that
//! must see a ClientHello the classifier buffered).

use std::{
  io,
  pin::Pin,
  task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct Rewound<IO> {
  prefix: Vec<u8>,
  inner:  IO,
}

impl<IO> Rewound<IO> {
  pub fn new(prefix: Vec<u8>, inner: IO) -> Self { Self { prefix, inner } }
}

impl<IO: AsyncRead + Unpin> AsyncRead for Rewound<IO> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    if !this.prefix.is_empty() {
      let n = this.prefix.len().min(buf.remaining());
      buf.put_slice(&this.prefix[..n]);
      this.prefix.drain(..n);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for Rewound<IO> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    data: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}
