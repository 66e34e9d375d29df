//! `sitrep-extract` — the LLM gateway.
//!
//! Turns batches of normalized messages into structured [`Event`] records
//! through a rate-budgeted model call. Admission goes through the
//! [`budget::BudgetLedger`] (per-minute and per-hour sliding windows); no
//! call is ever issued without it. Model output is schema-validated at this
//! boundary — invalid payloads never propagate further into the system.
//!
//! [`Event`]: sitrep_core::types::Event

pub mod budget;
pub mod extractor;
pub mod gemini;
pub mod prompt;
pub mod provider;
pub mod schema;

pub use budget::{Admission, BudgetLedger};
pub use extractor::{Batch, Extractor, ReleasedBatch};
pub use provider::{LlmProvider, ProviderError};
