//! Typed vocabulary for the notifications fanned out over IPC (§4.5): the
//! three MCP list-changed callbacks plus the transport's generic message
//! callback. A CLI consumer (`session shell`) matches on this instead of
//! the raw method string.

use serde::{Deserialize, Serialize};

use crate::ipc::Notification;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    ToolsListChanged,
    ResourcesListChanged,
    PromptsListChanged,
    Message { method: String, params: Option<serde_json::Value> },
}

impl SessionEvent {
    pub fn from_notification(n: &Notification) -> Self {
        match n.method.as_str() {
            "notifications/tools/list_changed" => SessionEvent::ToolsListChanged,
            "notifications/resources/list_changed" => SessionEvent::ResourcesListChanged,
            "notifications/prompts/list_changed" => SessionEvent::PromptsListChanged,
            _ => SessionEvent::Message { method: n.method.clone(), params: n.params.clone() },
        }
    }

    /// `rmcp::model::ServerNotification` mirrors the MCP wire shape (a
    /// `method` plus optional `params`), so the same method-name vocabulary
    /// above applies once it's serialized back to JSON.
    pub fn from_server_notification(n: &rmcp::model::ServerNotification) -> Self {
        let value = serde_json::to_value(n).unwrap_or(serde_json::Value::Null);
        let method = value
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("notifications/message")
            .to_string();
        let params = value.get("params").cloned();
        Self::from_notification(&Notification { method, params })
    }

    pub fn to_notification(&self) -> Notification {
        match self {
            SessionEvent::ToolsListChanged => {
                Notification { method: "notifications/tools/list_changed".to_string(), params: None }
            }
            SessionEvent::ResourcesListChanged => {
                Notification { method: "notifications/resources/list_changed".to_string(), params: None }
            }
            SessionEvent::PromptsListChanged => {
                Notification { method: "notifications/prompts/list_changed".to_string(), params: None }
            }
            SessionEvent::Message { method, params } => {
                Notification { method: method.clone(), params: params.clone() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_methods_map_to_typed_variants() {
        let n = Notification { method: "notifications/tools/list_changed".to_string(), params: None };
        assert_eq!(SessionEvent::from_notification(&n), SessionEvent::ToolsListChanged);
    }

    #[test]
    fn unknown_methods_fall_back_to_message() {
        let n = Notification {
            method: "notifications/message".to_string(),
            params: Some(serde_json::json!({"level": "info"})),
        };
        match SessionEvent::from_notification(&n) {
            SessionEvent::Message { method, .. } => assert_eq!(method, "notifications/message"),
            other => panic!("expected Message, got {other:?}"),
        }
    }
}
