//! Module execution backends.
//!
//! A module is run either by an in-process handler ([`LocalExecutor`]) or
//! by an external program reached through the cross-environment bridge
//! ([`ExternalExecutor`]). Both sit behind the [`ModuleExecutor`] trait.

pub mod bridge;
pub mod environment;
pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::core::registry::{ModuleDescriptor, RegistryError, ValidationError};
use crate::domain::{ErrorKind, ErrorStage};

pub use bridge::{Bridge, BridgeError, ExternalExecutor, Invocation};
pub use environment::{CommandSpec, Environment, EnvironmentKind};
pub use local::{Handler, HandlerCatalog, HandlerFactory, LocalExecutor, IGNORED_PARAMS_KEY};

/// Values bound for one category of one step.
///
/// The module's static configuration always comes from its descriptor;
/// executors combine the two.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleRequest {
    /// Values produced by the step's input bindings
    pub params: Map<String, Value>,
}

impl ModuleRequest {
    pub fn new(params: Map<String, Value>) -> Self {
        Self { params }
    }

    /// Handler init parameters: module config overlaid with the bound params
    pub fn init_params(&self, module: &ModuleDescriptor) -> Map<String, Value> {
        let mut merged = module.config.clone();
        merged.extend(self.params.clone());
        merged
    }

    /// Request document written for an external module
    pub fn payload(&self, module: &ModuleDescriptor) -> Value {
        json!({
            "params": self.params,
            "config": module.config,
        })
    }
}

/// Anything that can go wrong between resolving a module and getting its result
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Invalid input binding: {0}")]
    Binding(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Local handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },
}

impl DispatchError {
    /// Taxonomy entry for reports
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Registry(_) | DispatchError::Binding(_) => ErrorKind::Configuration,
            DispatchError::Validation(_) => ErrorKind::Validation,
            DispatchError::Bridge(e) => e.kind(),
            DispatchError::Handler { .. } => ErrorKind::Handler,
        }
    }

    /// Where in the step the failure happened
    pub fn stage(&self) -> ErrorStage {
        match self {
            DispatchError::Registry(_) | DispatchError::Binding(_) => ErrorStage::Resolve,
            DispatchError::Validation(_) => ErrorStage::Validate,
            DispatchError::Bridge(_) | DispatchError::Handler { .. } => ErrorStage::Dispatch,
        }
    }
}

/// Trait for module execution backends
#[async_trait]
pub trait ModuleExecutor: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Run a module and return its structured result
    async fn execute(
        &self,
        module: &ModuleDescriptor,
        request: &ModuleRequest,
        timeout: Duration,
    ) -> Result<Value, DispatchError>;
}
