use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Dense numeric identifier of a registered service.
///
/// Ids are assigned by the registry at startup and are stable for the
/// lifetime of the process: unique, starting at 0, with no holes.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(transparent)]
pub struct ServiceId(u32);

impl ServiceId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn inner(&self) -> u32 {
        self.0
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ServiceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl FromStr for ServiceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(Self)
    }
}

/// Correlation id for one submission to a worker pool.
///
/// Ids come from a single process-wide counter that wraps at `u32::MAX`
/// and never yields 0, so 0 can double as the "no request" marker inside
/// worker liveness cells.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RequestId(u32);

impl RequestId {
    /// Returns `None` for 0, which is never a valid request id.
    pub fn new(raw: u32) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_rejects_zero() {
        assert!(RequestId::new(0).is_none());
        assert_eq!(RequestId::new(7).unwrap().raw(), 7);
    }

    #[test]
    fn service_id_parses_digits_only() {
        assert_eq!("12".parse::<ServiceId>().unwrap(), ServiceId::new(12));
        assert!("ip".parse::<ServiceId>().is_err());
        assert!("-1".parse::<ServiceId>().is_err());
    }
}
