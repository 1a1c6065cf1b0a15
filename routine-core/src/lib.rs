//! Core types for durable routines: identities, descriptors, the explicit
//! state machine contract and the intents a turn produces.

pub mod codec;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod intent;
pub mod message;
pub mod primitives;
pub mod registry;
pub mod state;
pub mod task;

pub use context::{TurnContext, TurnHost};
pub use descriptor::{
    CallerDescriptor, CallerInfo, ContinuationDescriptor, RoutineDescriptor, TransitionKind,
};
pub use error::CoreError;
pub use message::{Delivery, MessageOrigin, TransitionMessage};
pub use primitives::{ETag, IntentId, MethodId, RoutineId, RoutineKey, ServiceId, TaskId, TriggerId};
pub use registry::{MethodOptions, RoutineRegistry, RoutineResolver, StatePolicy};
pub use state::{Fault, RoutineResult, RoutineState, StateEnvelope};
pub use task::{Awaiting, Routine, Turn, TurnPoll, routine_fn};
