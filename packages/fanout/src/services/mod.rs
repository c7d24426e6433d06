pub mod builtin;

use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

use fanout_types::ServiceSpec;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// Anything the plugin wants to surface. Reaches the caller as
    /// `{server: "Service raised exception", exception: <msg>}`.
    #[error("{0}")]
    Runtime(String),
}

impl ServiceError {
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// A hosted service plugin.
///
/// Implementations are registered explicitly (collected into a table that
/// the registry consumes at startup) and shared across all workers of the
/// pool, so `run` must be safe to call from several threads at once.
/// A panic inside `run`/`run_list` is caught by the worker and treated
/// like a returned error.
pub trait Service: Send + Sync {
    /// Declared attributes, read once at registration.
    fn spec(&self) -> ServiceSpec;

    fn run(&self, request: &str) -> ServiceResult<Value>;

    /// Batch form, only called when the spec sets `allow_batch`. The
    /// output must have exactly one entry per input.
    fn run_list(&self, requests: &[String]) -> ServiceResult<Vec<Value>> {
        Ok(requests
            .iter()
            .map(|_| json!({"server": "Not implemented"}))
            .collect())
    }

    /// Called once when the pool starts, bounded by `service_start_timeout`.
    fn start(&self) -> ServiceResult<()> {
        Ok(())
    }

    /// Called once when the pool stops, bounded by `service_shutdown_timeout`.
    fn shutdown(&self) -> ServiceResult<()> {
        Ok(())
    }
}

pub type SharedService = Arc<dyn Service>;

/// The registration table consumed by `main`. Tests build their own.
pub fn default_services() -> Vec<SharedService> {
    builtin::all()
}
