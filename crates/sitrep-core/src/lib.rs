pub mod config;
pub mod counters;
pub mod error;
pub mod normalize;
pub mod sources;
pub mod types;

pub use error::{CoreError, Result};
pub use types::{
    ClusterId, ClusterState, Event, EventId, EventKind, IngestState, Lang, MessageRef,
    NormalizedMessage, RawMessage, SourceAuthority, SourceClass, SourceId,
};
