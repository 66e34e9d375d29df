//! `sitrep-sender` — output gating and delivery.
//!
//! Consumes emission orders from the correlation engine, renders the wire
//! format, and enforces the minimum interval between summaries. Retractions
//! bypass the gate.

pub mod format;
pub mod gate;
pub mod sender;

pub use format::{badge, render_retraction, render_summary};
pub use gate::RateGate;
pub use sender::{OutboundSink, Sender, SinkError};
