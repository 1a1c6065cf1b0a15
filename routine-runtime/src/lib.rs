//! Transition engine for durable routines.
//!
//! A routine advances one turn per message. The [`TransitionRunner`] loads the
//! routine's state, runs the turn inside a transition scope, classifies what
//! the turn left behind and commits the resulting intents to the fabric:
//! state first, then calls, deliveries, events and triggers. Completed results
//! reach in-process waiters through the [`CompletionHub`].
//!
//! ```rust,ignore
//! let engine = Engine::new(InMemoryFabric::new(), JsonCodec, registry, EngineOptions::default());
//! let key = engine.invoke(MethodId::new("Orders", "PlaceOrder"), input).await?;
//! engine.worker(WorkerOptions::default()).run_until_idle().await?;
//! let result = engine.poll(&key).await?;
//! ```

pub mod serialization;

mod commit;
pub mod engine;
pub mod error;
pub mod hub;
pub mod monitor;
pub mod options;
pub mod runner;
pub mod scope;
pub mod worker;

// Re-exports
pub use commit::{TRIGGER_PARTITION, trigger_key};
pub use engine::Engine;
pub use error::TransitionError;
pub use hub::{CompletionHub, ReplySource, ResultSource, StoreSource, SubscriptionToken};
pub use monitor::{
    BranchOrigin, BranchWiring, IntrinsicFlow, JoinFlow, TransitionMonitor, TurnResult,
};
pub use options::{EngineOptions, HubOptions, WorkerOptions};
pub use runner::{TransitionOutcome, TransitionRunner};
pub use serialization::JsonCodec;
pub use worker::TransitionWorker;
