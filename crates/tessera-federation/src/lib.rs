//! tessera-federation - Cross-service record resolution for tessera.
//!
//! Services exposing tessera-backed stores stay independent; this crate
//! stitches their records together at read time. A `DtoFactory` interprets
//! resolver descriptors, a `SubgraphClient` speaks the one-endpoint POST
//! protocol to sibling services, and a request-scoped `LoaderRegistry`
//! collapses N sibling lookups into one aliased request per endpoint.
//!
//! The protocol is explicit: resolvers enqueue, the glue calls
//! `flush_all()`, pending handles resolve. Temporal bounds travel with
//! every DTO so federated reads observe the same instant as the root query.

mod dto;
mod loader;
mod selection;
mod subgraph;

pub use dto::{Dto, DtoFactory, Resolution};
pub use loader::{BatchLoader, LoaderRegistry, PendingValue};
pub use selection::{SelectionField, SelectionSet};
pub use subgraph::{HttpTransport, SubgraphClient, SubgraphTransport};

// Re-export core types for convenience
pub use tessera_core::{ResolverConfig, TesseraError, TesseraResult};
