use serde::{Deserialize, Serialize};

use crate::ServiceId;

/// What a service plugin declares about itself before registration.
///
/// The registry validates these, fills in a missing `service_id` with the
/// lowest unused value and then snapshots the result into an immutable
/// [`ServiceDescriptor`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Unique name. ASCII letters, digits or ` _-.`, must not end in one
    /// of those characters. `server` and `auto` are reserved.
    pub name: String,
    pub description: String,
    /// `None` means "assign one for me".
    pub service_id: Option<u32>,
    /// Worker threads sharing the process address space.
    pub threads: u32,
    /// Workers the service asks to isolate. Counted into the pool size;
    /// see the registry docs for how isolation is realized.
    pub processes: u32,
    /// Seconds a worker may spend inside `run` before the supervisor
    /// considers it stalled. 0 disables supervision for this service.
    pub timeout: u32,
    /// Cumulative stalls after which the whole service is stopped.
    /// 0 means unlimited restarts.
    pub max_timeouts: u32,
    pub groups: Vec<String>,
    /// Whether `run_list` accepts a whole batch natively.
    pub allow_batch: bool,
    /// Skipped at registration time when set.
    pub ignore: bool,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            service_id: None,
            threads: 1,
            processes: 0,
            timeout: 0,
            max_timeouts: 3,
            groups: Vec::new(),
            allow_batch: false,
            ignore: false,
        }
    }
}

/// Immutable snapshot of a validated service, frozen at registration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub name: String,
    pub description: String,
    pub threads: u32,
    pub processes: u32,
    pub timeout: u32,
    pub max_timeouts: u32,
    pub groups: Vec<String>,
    pub allow_batch: bool,
}

impl ServiceDescriptor {
    pub fn workers(&self) -> u32 {
        self.threads + self.processes
    }
}
