//! Immutable run context: snapshots and enrichments.

mod enrichments;
mod snapshot;

pub use enrichments::{DocumentEnrichment, MemoryEnrichment, ProfileEnrichment};
pub use snapshot::{ContextSnapshot, ContextSnapshotBuilder, Message, Role, RoutingDecision};
