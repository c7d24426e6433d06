use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RequestId;

/// One work item as it travels down a service input channel.
///
/// A single URL dispatch submits `One`; the list endpoints submit the
/// deduplicated misses as a single `Many` under one request id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    One(String),
    Many(Vec<String>),
}

impl Payload {
    /// Number of individual requests carried. Used by the supervisor to
    /// scale the stall budget for batch payloads.
    pub fn len(&self) -> usize {
        match self {
            Payload::One(_) => 1,
            Payload::Many(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a worker publishes back: shaped like the payload it consumed.
#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    One(Value),
    Many(Vec<Value>),
}

impl Output {
    pub fn len(&self) -> usize {
        match self {
            Output::One(_) => 1,
            Output::Many(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Item on a service input channel. `None` is the wake-up sentinel that
/// makes a blocked worker re-check its service running flag.
pub type WorkItem = Option<(RequestId, Payload)>;

/// Item on a service output channel.
pub type WorkResult = (RequestId, Output);

/// A cached service result: the output plus the moment it was produced.
/// Serialized as-is into response bodies under the service name key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CachedResult {
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl CachedResult {
    pub fn new(output: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            output,
        }
    }

    /// Age in seconds relative to `now`.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }
}
