use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ServiceId;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

/// The `server` block present in every dispatch response.
///
/// Single-service calls carry `service_id`/`service_name`; group calls
/// carry `group`/`service_ids`/`service_names`. `message` is only set on
/// errors, `response` is the wall-clock seconds spent serving the call.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServerBlock {
    pub state: DispatchState,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<ServiceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_ids: Option<Vec<ServiceId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServerBlock {
    pub fn ok(input: Value) -> Self {
        Self {
            state: DispatchState::Ok,
            input,
            service_id: None,
            service_name: None,
            group: None,
            service_ids: None,
            service_names: None,
            response: None,
            message: None,
        }
    }

    pub fn service(input: Value, id: ServiceId, name: impl Into<String>) -> Self {
        Self {
            service_id: Some(id),
            service_name: Some(name.into()),
            ..Self::ok(input)
        }
    }

    pub fn group(input: Value, group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..Self::ok(input)
        }
    }

    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.state = DispatchState::Error;
        self.message = Some(message.into());
        self
    }

    /// Stamps the serving time, rounded to 3 decimals like the rest of
    /// the wire format.
    pub fn timed(mut self, seconds: f64) -> Self {
        self.response = Some((seconds * 1000.0).round() / 1000.0);
        self
    }
}

/// Full dispatch response: the `server` block plus one entry per service,
/// keyed by service name at the top level of the JSON object.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DispatchResponse {
    pub server: ServerBlock,
    #[serde(flatten)]
    pub outputs: BTreeMap<String, Value>,
}

impl DispatchResponse {
    pub fn new(server: ServerBlock) -> Self {
        Self {
            server,
            outputs: BTreeMap::new(),
        }
    }

    pub fn error(server: ServerBlock, message: impl Into<String>) -> Self {
        Self::new(server.fail(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outputs_flatten_to_top_level() {
        let mut response = DispatchResponse::new(
            ServerBlock::service(json!("abc"), ServiceId::new(0), "echo").timed(0.0123456),
        );
        response
            .outputs
            .insert("echo".into(), json!({"echo": "abc"}));

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["server"]["state"], json!("OK"));
        assert_eq!(value["server"]["response"], json!(0.012));
        assert_eq!(value["echo"], json!({"echo": "abc"}));
        assert!(value["server"].get("message").is_none());
    }

    #[test]
    fn error_block_carries_message() {
        let response = DispatchResponse::error(
            ServerBlock::group(json!("x"), "g"),
            "Insufficient permissions",
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["server"]["state"], json!("ERROR"));
        assert_eq!(value["server"]["message"], json!("Insufficient permissions"));
    }
}
