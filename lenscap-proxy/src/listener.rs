//! TCP listener: binds the preferred port (falling back to an ephemeral one
//! when it is taken), spawns one connection task per acceptance, and shuts
//! down through a watch channel that also cancels live connections.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, info, warn};

use crate::{connection, errors::ProxyError, Engine};

pub struct ProxyListener {
  engine:      Arc<Engine>,
  listener:    TcpListener,
  shutdown_tx: Arc<watch::Sender<bool>>,
  shutdown_rx: watch::Receiver<bool>,
}

/// Clonable handle that stops the listener and cancels live connections.
#[derive(Clone)]
pub struct ShutdownHandle {
  tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
  pub fn shutdown(&self) { let _ = self.tx.send(true); }
}

impl ProxyListener {
  pub async fn bind(engine: Arc<Engine>) -> Result<Self, ProxyError> {
    let addr = engine.config.listen_addr.clone();
    let preferred = engine.config.listen_port;
    let listener = match TcpListener::bind((addr.as_str(), preferred)).await {
      Ok(listener) => listener,
      Err(e) if e.kind() == io::ErrorKind::AddrInUse && preferred != 0 => {
        warn!(preferred, "port in use, falling back to an ephemeral port");
        TcpListener::bind((addr.as_str(), 0)).await?
      },
      Err(e) => return Err(ProxyError::Config(format!("cannot bind {addr}:{preferred}: {e}"))),
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    Ok(Self { engine, listener, shutdown_tx: Arc::new(shutdown_tx), shutdown_rx })
  }

  /// The actually-bound address (the port may be ephemeral).
  pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
    Ok(self.listener.local_addr()?)
  }

  pub fn shutdown_handle(&self) -> ShutdownHandle {
    ShutdownHandle { tx: self.shutdown_tx.clone() }
  }

  /// Accept loop; returns once the shutdown handle fires.
  pub async fn run(self) {
    let mut shutdown = self.shutdown_rx.clone();
    info!(addr = %self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "proxy listening");
    loop {
      tokio::select! {
        accepted = self.listener.accept() => {
          match accepted {
            Ok((stream, peer)) => {
              debug!(%peer, "accepted connection");
              let engine = self.engine.clone();
              let shutdown = self.shutdown_rx.clone();
              tokio::spawn(connection::handle_connection(engine, stream, shutdown));
            },
            Err(e) => warn!("accept failed: {e}"),
          }
        },
        _ = shutdown.changed() => {
          info!("listener shutting down");
          return;
        },
      }
    }
  }
}
