pub mod agents;
pub mod daemon;
pub mod escalations;
pub mod messages;
pub mod territory;
