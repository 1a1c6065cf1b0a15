//! Storage and messaging fabric for durable routines.
//!
//! The engine talks to its backend only through the [`Fabric`] trait:
//!
//! - **Records**: one [`RoutineRecord`] per (service, routine id), created
//!   exclusively and replaced only by a writer that presents the current
//!   [`ETag`](routine_core::ETag).
//! - **Queue**: transition messages, optionally invisible until a resume time.
//! - **Events** and **dead letters**: one-way hand-offs.
//!
//! [`InMemoryFabric`] is the reference implementation.
//!
//! # Implementing Custom Backends
//!
//! ```rust,ignore
//! use routine_fabric::{Fabric, FabricError, RoutineRecord};
//! use async_trait::async_trait;
//!
//! pub struct TableFabric {
//!     // table and queue clients
//! }
//!
//! #[async_trait]
//! impl Fabric for TableFabric {
//!     async fn create_if_absent(&self, record: RoutineRecord) -> Result<ETag, FabricError> {
//!         // insert with "if-none-match: *"
//!     }
//!     // ... implement other methods
//! }
//! ```

mod backend;
mod in_memory;
mod record;

pub use backend::{Fabric, FabricError, PublishedEvent};
pub use in_memory::InMemoryFabric;
pub use record::{RoutineRecord, RoutineStatus};
