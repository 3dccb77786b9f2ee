pub mod clone_session;
pub mod context;
pub mod event;
pub mod lease;
pub mod message;
pub mod negotiation;
