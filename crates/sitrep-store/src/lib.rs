//! `sitrep-store` — append-oriented SQLite persistence.
//!
//! Owns every durable table: raw message fingerprints, extracted events,
//! trend clusters, the authority ledger, and the emission log. All writes
//! are acknowledged only after they hit the database; batch writes commit
//! atomically. In-memory copies held by the pipeline and correlator are
//! caches reconstructible from here.

pub mod db;
pub mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::{PutOutcome, Store};
