use jsonrpsee::core::RpcResult;
use jsonrpsee::server::RpcModule;
use jsonrpsee::types::ErrorObjectOwned;

use crate::daemon::DaemonCtx;
use crate::rpc::{AgentStartParams, AgentStartResult};

/// Register agent.start: spawn a configured agent process.
pub fn register(module: &mut RpcModule<DaemonCtx>) {
  module
    .register_method(
      "agent.start",
      |params, ctx: &DaemonCtx, _ext| -> RpcResult<serde_json::Value> {
        let p: AgentStartParams = params.parse()?;
        let id = ctx
          .core
          .start_agent(&p.agent, p.id)
          .map_err(|e| ErrorObjectOwned::owned(-32030, e.to_string(), None::<()>))?;
        Ok(serde_json::json!(AgentStartResult { id: id.to_string() }))
      },
    )
    .expect("register agent.start");
}
