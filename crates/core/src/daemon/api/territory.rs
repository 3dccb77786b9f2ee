use jsonrpsee::core::RpcResult;
use jsonrpsee::server::RpcModule;

use crate::daemon::DaemonCtx;

/// Register territory.status: lease table, queue depths, pool statistics.
pub fn register(module: &mut RpcModule<DaemonCtx>) {
  module
    .register_method(
      "territory.status",
      |_params, ctx: &DaemonCtx, _ext| -> RpcResult<serde_json::Value> {
        Ok(serde_json::json!(ctx.core.status()))
      },
    )
    .expect("register territory.status");
}
