use jsonrpsee::core::RpcResult;
use jsonrpsee::server::RpcModule;
use jsonrpsee::types::ErrorObjectOwned;
use tracing::info;

use crate::daemon::DaemonCtx;
use crate::rpc::{EscalationListResult, EscalationResolveParams};

/// Register escalation.list and escalation.resolve. Verdicts arrive whenever
/// the director gets around to them; the core never blocked waiting.
pub fn register(module: &mut RpcModule<DaemonCtx>) {
  module
    .register_method(
      "escalation.list",
      |_params, ctx: &DaemonCtx, _ext| -> RpcResult<serde_json::Value> {
        let escalations = ctx.core.escalations();
        Ok(serde_json::json!(EscalationListResult { escalations }))
      },
    )
    .expect("register escalation.list");

  module
    .register_method(
      "escalation.resolve",
      |params, ctx: &DaemonCtx, _ext| -> RpcResult<serde_json::Value> {
        let p: EscalationResolveParams = params.parse()?;
        ctx
          .core
          .resolve_escalation(p.id, p.verdict)
          .map_err(|e| ErrorObjectOwned::owned(-32020, e.to_string(), None::<()>))?;
        info!(event = "escalation_resolve", id = %p.id, verdict = ?p.verdict, "verdict accepted via rpc");
        Ok(serde_json::json!(true))
      },
    )
    .expect("register escalation.resolve");
}
