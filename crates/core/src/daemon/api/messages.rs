use jsonrpsee::core::RpcResult;
use jsonrpsee::server::RpcModule;
use jsonrpsee::types::ErrorObjectOwned;
use tracing::info;

use crate::daemon::DaemonCtx;
use crate::daemon::service::DIRECTOR_ID;
use crate::domain::message::{AgentId, Recipient, SenderRole};
use crate::routing::RouterError;
use crate::rpc::{MessageSendParams, MessageSendResult};

/// Register message.send: director-side submission into the router.
pub fn register(module: &mut RpcModule<DaemonCtx>) {
  module
    .register_method(
      "message.send",
      |params, ctx: &DaemonCtx, _ext| -> RpcResult<serde_json::Value> {
        let p: MessageSendParams = params.parse()?;
        let recipient = match p.to {
          Some(name) => Recipient::Agent(AgentId::new(name)),
          None => Recipient::Broadcast,
        };
        let id = ctx
          .core
          .submit_message(
            AgentId::from(DIRECTOR_ID),
            SenderRole::Director,
            recipient,
            p.priority,
            p.body,
            p.payload,
          )
          .map_err(|e| match e {
            RouterError::RateLimited { retry_after } => ErrorObjectOwned::owned(
              -32010,
              format!("rate limited; retry after {}ms", retry_after.as_millis()),
              None::<()>,
            ),
            other => ErrorObjectOwned::owned(-32011, other.to_string(), None::<()>),
          })?;
        info!(event = "message_send", id = %id, priority = %p.priority, "message submitted via rpc");
        Ok(serde_json::json!(MessageSendResult { id: id.to_string() }))
      },
    )
    .expect("register message.send");
}
