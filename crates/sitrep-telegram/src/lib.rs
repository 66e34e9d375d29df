//! Telegram delivery surface.
//!
//! Two bot roles share one token: the outbound sink that publishes cluster
//! summaries to the output channel, and the control surface that answers
//! `/status` and `/stats` in the operator chat. Ingestion is NOT here — raw
//! source messages arrive through the listener session feeding the daemon's
//! ingest channel.

pub mod control;
pub mod send;
pub mod sink;

pub use control::{run_control_bot, ControlContext};
pub use sink::TelegramSink;
