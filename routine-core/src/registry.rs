//! Routine registry: maps method ids to routine implementations.
//!
//! Messages and persisted records only carry a [`MethodId`]; the code that
//! runs a turn is looked up here. Like any registry of closures it is code,
//! not data: every worker that may process a message for a method must build
//! a registry containing that method.
//!
//! ```rust,ignore
//! fn build_registry() -> RoutineRegistry {
//!     RoutineRegistry::builder()
//!         .register_fn(MethodId::new("Orders", "PlaceOrder"), place_order)
//!         .register_with_options(
//!             MethodId::new("Orders", "Aggregate"),
//!             Aggregate,
//!             MethodOptions::default().fan_in(),
//!         )
//!         .build()
//! }
//! ```

use crate::context::TurnContext;
use crate::error::CoreError;
use crate::primitives::MethodId;
use crate::state::RoutineState;
use crate::task::{Routine, Turn, UntypedRoutine, routine_fn};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Where non-final routine state lives between turns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatePolicy {
    /// Encode state inline in the next outbound message.
    #[default]
    Roaming,
    /// Write state to the record store with an ETag precondition.
    Persisted,
}

/// Per-method settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodOptions {
    /// Several concurrent branches merge into one record. Forces persistence.
    pub fan_in: bool,
    /// Overrides the engine-wide state policy.
    pub state_policy: Option<StatePolicy>,
}

impl MethodOptions {
    #[must_use]
    pub fn fan_in(mut self) -> Self {
        self.fan_in = true;
        self
    }

    #[must_use]
    pub fn with_state_policy(mut self, policy: StatePolicy) -> Self {
        self.state_policy = Some(policy);
        self
    }

    /// Effective policy given the engine default.
    pub fn resolve_policy(&self, default: StatePolicy) -> StatePolicy {
        if self.fan_in {
            return StatePolicy::Persisted;
        }
        self.state_policy.unwrap_or(default)
    }
}

/// Resolves a method id to an executable routine.
pub trait RoutineResolver: Send + Sync {
    fn resolve(&self, method: &MethodId) -> Option<(UntypedRoutine, MethodOptions)>;
}

/// A factory that produces the routine instance serving a method.
pub type RoutineFactory = Box<dyn Fn() -> UntypedRoutine + Send + Sync>;

pub struct RoutineEntry {
    factory: RoutineFactory,
    options: MethodOptions,
}

#[derive(Default)]
pub struct RoutineRegistry {
    routines: HashMap<MethodId, RoutineEntry>,
}

impl RoutineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            registry: Self::new(),
            rejected: Vec::new(),
        }
    }

    /// Register a routine with default options.
    pub fn register<R>(&mut self, method: MethodId, routine: R) -> Result<(), CoreError>
    where
        R: Routine + 'static,
    {
        self.register_with_options(method, routine, MethodOptions::default())
    }

    pub fn register_with_options<R>(
        &mut self,
        method: MethodId,
        routine: R,
        options: MethodOptions,
    ) -> Result<(), CoreError>
    where
        R: Routine + 'static,
    {
        let routine: UntypedRoutine = Arc::new(routine);
        self.insert(
            method,
            RoutineEntry {
                factory: Box::new(move || Arc::clone(&routine)),
                options,
            },
        )
    }

    /// Register a closure as a routine.
    pub fn register_fn<F, Fut>(&mut self, method: MethodId, func: F) -> Result<(), CoreError>
    where
        F: Fn(RoutineState, TurnContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Turn>> + Send + 'static,
    {
        self.register(method, routine_fn(func))
    }

    fn insert(&mut self, method: MethodId, entry: RoutineEntry) -> Result<(), CoreError> {
        if self.routines.contains_key(&method) {
            return Err(CoreError::DuplicateMethod(method));
        }
        self.routines.insert(method, entry);
        Ok(())
    }

    pub fn get(&self, method: &MethodId) -> Option<UntypedRoutine> {
        self.routines.get(method).map(|entry| (entry.factory)())
    }

    pub fn options(&self, method: &MethodId) -> Option<&MethodOptions> {
        self.routines.get(method).map(|entry| &entry.options)
    }

    pub fn contains(&self, method: &MethodId) -> bool {
        self.routines.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodId> {
        self.routines.keys()
    }
}

impl RoutineResolver for RoutineRegistry {
    fn resolve(&self, method: &MethodId) -> Option<(UntypedRoutine, MethodOptions)> {
        self.routines
            .get(method)
            .map(|entry| ((entry.factory)(), entry.options.clone()))
    }
}

/// Builder for chained registration.
///
/// A duplicate method keeps its first routine. [`build`](Self::build) logs
/// every rejected registration; [`try_build`](Self::try_build) fails on it.
pub struct RegistryBuilder {
    registry: RoutineRegistry,
    rejected: Vec<CoreError>,
}

impl RegistryBuilder {
    pub fn register<R>(self, method: MethodId, routine: R) -> Self
    where
        R: Routine + 'static,
    {
        self.register_with_options(method, routine, MethodOptions::default())
    }

    pub fn register_with_options<R>(
        mut self,
        method: MethodId,
        routine: R,
        options: MethodOptions,
    ) -> Self
    where
        R: Routine + 'static,
    {
        if let Err(e) = self.registry.register_with_options(method, routine, options) {
            self.rejected.push(e);
        }
        self
    }

    pub fn register_fn<F, Fut>(self, method: MethodId, func: F) -> Self
    where
        F: Fn(RoutineState, TurnContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Turn>> + Send + 'static,
    {
        self.register(method, routine_fn(func))
    }

    pub fn register_fn_with_options<F, Fut>(
        self,
        method: MethodId,
        func: F,
        options: MethodOptions,
    ) -> Self
    where
        F: Fn(RoutineState, TurnContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Turn>> + Send + 'static,
    {
        self.register_with_options(method, routine_fn(func), options)
    }

    /// Registrations rejected so far.
    pub fn rejected(&self) -> &[CoreError] {
        &self.rejected
    }

    pub fn build(self) -> RoutineRegistry {
        for error in &self.rejected {
            tracing::warn!(error = %error, "Registration rejected, first routine kept");
        }
        self.registry
    }

    /// Like [`build`](Self::build), but a rejected registration is an error.
    ///
    /// # Errors
    ///
    /// Returns the first rejection, e.g. `CoreError::DuplicateMethod`.
    pub fn try_build(self) -> Result<RoutineRegistry, CoreError> {
        match self.rejected.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(self.registry),
        }
    }
}
