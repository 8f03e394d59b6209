//! Response envelope
//!
//! Every JSON response is `{ status, data, messages }`. View responses
//! nest their items and pagination block under `data`.

use serde::{Deserialize, Serialize};

/// One entry of the `messages` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    /// Stable code: an error kind or a declared message code.
    pub code: String,
    /// `error`, `warning` or `info`.
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: EnvelopeStatus,
    pub data: Option<T>,
    pub messages: Vec<ApiMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Ok,
    Error,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: EnvelopeStatus::Ok,
            data: Some(data),
            messages: Vec::new(),
        }
    }

    pub fn ok_with_messages(data: T, messages: Vec<ApiMessage>) -> Self {
        Self {
            status: EnvelopeStatus::Ok,
            data: Some(data),
            messages,
        }
    }

    pub fn error(messages: Vec<ApiMessage>) -> Self {
        Self {
            status: EnvelopeStatus::Error,
            data: None,
            messages,
        }
    }
}

/// Pagination block of a view response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub has_next: bool,
    pub has_prev: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

/// View response payload: items plus pagination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<serde_json::Value>,
    pub pagination: Pagination,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ok_envelope_shape() {
        let envelope = Envelope::ok(json!({"id": "x"}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["data"]["id"], "x");
        assert_eq!(value["messages"], json!([]));
    }

    #[test]
    fn test_error_envelope_shape() {
        let envelope: Envelope<serde_json::Value> = Envelope::error(vec![ApiMessage {
            code: "TICKET_CLOSED".to_string(),
            level: "error".to_string(),
            message: None,
        }]);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["data"], serde_json::Value::Null);
        assert_eq!(value["messages"][0]["code"], "TICKET_CLOSED");
        // Optional message is omitted entirely.
        assert!(value["messages"][0].get("message").is_none());
    }

    #[test]
    fn test_pagination_optional_fields() {
        let page = Page {
            items: vec![],
            pagination: Pagination {
                limit: 50,
                has_next: false,
                has_prev: false,
                next_cursor: None,
                prev_cursor: None,
                total: None,
            },
        };
        let value = serde_json::to_value(&page).unwrap();
        assert!(value["pagination"].get("next_cursor").is_none());
        assert!(value["pagination"].get("total").is_none());
    }
}
