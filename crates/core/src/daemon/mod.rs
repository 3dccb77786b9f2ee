use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};

use jsonrpsee::server::RpcModule;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod api;
mod server;
pub mod service;

pub use service::Core;

use server::{shutdown_channel, start as start_server};

/// Shared context handed to every RPC handler.
#[derive(Clone)]
pub struct DaemonCtx {
  pub core: Arc<Core>,
  pub socket_path: PathBuf,
}

/// Handle to the running daemon: the RPC server plus the core event loop.
pub struct DaemonHandle {
  server_task: JoinHandle<()>,
  core_task: JoinHandle<()>,
  socket_path: PathBuf,
  shutdown_tx: watch::Sender<bool>,
  // Keep the server handle alive to prevent immediate shutdown
  _server_handle: jsonrpsee::server::ServerHandle,
}

impl DaemonHandle {
  /// Stop both tasks and remove the socket file if it exists.
  pub fn stop(self) {
    let _ = self.shutdown_tx.send(true);
    self.server_task.abort();
    self.core_task.abort();
    let _ = fs::remove_file(&self.socket_path);
  }

  /// Await both tasks (e.g. after a shutdown requested over RPC).
  pub async fn wait(self) {
    let _ = self.server_task.await;
    let _ = self.core_task.await;
  }

  /// Get the socket path the daemon is bound to.
  pub fn socket_path(&self) -> &Path {
    &self.socket_path
  }
}

/// Start the JSON-RPC server over a Unix domain socket and the core event
/// loop that drives routing, leases, and clone discussions.
pub async fn start(core: Arc<Core>, socket_path: &Path) -> io::Result<DaemonHandle> {
  let ctx = DaemonCtx {
    core: Arc::clone(&core),
    socket_path: socket_path.to_path_buf(),
  };
  let mut module = RpcModule::new(ctx);

  // Prepare shutdown coordination and register APIs
  let (shutdown_tx, shutdown_rx) = shutdown_channel();
  api::daemon::register(&mut module, shutdown_tx.clone());
  api::messages::register(&mut module);
  api::territory::register(&mut module);
  api::escalations::register(&mut module);
  api::agents::register(&mut module);

  let (server_task, server_handle) = start_server(socket_path, module, shutdown_rx.clone())?;
  let core_task = tokio::spawn(core.run(shutdown_rx));

  Ok(DaemonHandle {
    server_task,
    core_task,
    socket_path: socket_path.to_path_buf(),
    shutdown_tx,
    _server_handle: server_handle,
  })
}
