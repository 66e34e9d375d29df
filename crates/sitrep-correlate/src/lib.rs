//! `sitrep-correlate` — cross-source consensus.
//!
//! Two single-writer tasks live here:
//!
//! * the correlation engine clusters extracted events that describe the same
//!   real-world occurrence, decides when a cluster is credible enough to
//!   emit, and detects contradictions;
//! * the authority ledger owns every source's credibility score, updated on
//!   cluster outcomes and decayed toward the neutral prior when idle, with a
//!   lock-free snapshot published to readers after each change.

pub mod authority;
pub mod engine;
pub mod report;

pub use authority::{AuthorityLedger, AuthorityUpdate};
pub use engine::CorrelationEngine;
pub use report::{EmissionReport, SendOrder};
