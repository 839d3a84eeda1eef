//! Conversation data model: turns, suggested services, actions, dialogue results.
//!
//! A `Turn` is immutable once appended; the ordered turn log is the sole
//! conversation memory. `DialogueResult` is transient and consumed once by the
//! session state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Wire name used in dialogue API messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One message in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Suggestions produced by the assistant (service mode).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_services: Vec<SuggestedService>,
}

impl Turn {
    /// Create a turn with a fresh id and the current timestamp.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        let prefix = match role {
            Role::User => "u_",
            Role::Assistant => "a_",
            Role::System => "s_",
        };
        Self {
            id: format!("{}{}", prefix, Uuid::new_v4().simple()),
            role,
            text: text.into(),
            timestamp: Utc::now(),
            suggested_services: Vec::new(),
        }
    }

    /// Attach suggested services (assistant turns in service mode).
    pub fn with_services(mut self, services: Vec<SuggestedService>) -> Self {
        self.suggested_services = services;
        self
    }
}

/// Category of a suggested service. Serialized as the wire field `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceCategory {
    Doctor,
    Lab,
    Pharmacy,
    Appointment,
    Other,
}

/// A service the assistant proposed to the user, with an optional executable template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedService {
    pub id: String,
    #[serde(rename = "type")]
    pub category: ServiceCategory,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Action template the session can execute after confirmation.
    #[serde(
        rename = "actionTemplate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub action_template: Option<ServiceAction>,
}

/// Kind of side-effecting service action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    BookDoctor,
    BookLab,
    OrderMedicine,
    Other,
}

/// A not-yet-executed side-effecting request (booking, order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl ServiceAction {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Dialogue mode reported by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogueMode {
    Chat,
    Service,
}

impl Default for DialogueMode {
    fn default() -> Self {
        DialogueMode::Chat
    }
}

/// Structured result of one dialogue invocation. Consumed once, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogueResult {
    #[serde(default)]
    pub reply: String,
    #[serde(default)]
    pub mode: DialogueMode,
    #[serde(default)]
    pub suggested_services: Vec<SuggestedService>,
    #[serde(default)]
    pub awaiting_confirmation: bool,
    #[serde(default)]
    pub action: Option<ServiceAction>,
}

impl DialogueResult {
    /// Plain chat reply with no structured payload.
    pub fn chat(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            mode: DialogueMode::Chat,
            suggested_services: Vec::new(),
            awaiting_confirmation: false,
            action: None,
        }
    }
}

fn default_success() -> bool {
    true
}

/// Result of executing a service action against a backend (or the mock).
///
/// A missing `success` field counts as success, matching the action API contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(rename = "bookingId", default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
    #[serde(
        rename = "orderId",
        alias = "order_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            booking_id: None,
            order_id: None,
            details: None,
            error: Some(error.into()),
        }
    }

    /// Booking/order reference for user-facing messages: bookingId, then orderId, else "N/A".
    pub fn reference(&self) -> &str {
        self.booking_id
            .as_deref()
            .or(self.order_id.as_deref())
            .unwrap_or("N/A")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_ids_carry_role_prefix() {
        assert!(Turn::new(Role::User, "hi").id.starts_with("u_"));
        assert!(Turn::new(Role::Assistant, "hi").id.starts_with("a_"));
    }

    #[test]
    fn dialogue_result_parses_camel_case() {
        let json = serde_json::json!({
            "reply": "I suggest a CBC test.",
            "mode": "service",
            "suggestedServices": [{
                "id": "svc1",
                "type": "lab",
                "title": "Book a CBC lab test",
                "actionTemplate": {"type": "book_lab", "params": {"tests": ["CBC"]}}
            }],
            "awaitingConfirmation": true,
            "action": {"type": "book_lab", "params": {"tests": ["CBC"]}}
        });
        let parsed: DialogueResult = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.mode, DialogueMode::Service);
        assert!(parsed.awaiting_confirmation);
        let svc = &parsed.suggested_services[0];
        assert_eq!(svc.category, ServiceCategory::Lab);
        assert_eq!(
            svc.action_template.as_ref().unwrap().kind,
            ActionKind::BookLab
        );
    }

    #[test]
    fn dialogue_result_defaults_on_sparse_payload() {
        let parsed: DialogueResult =
            serde_json::from_value(serde_json::json!({"reply": "Hello"})).unwrap();
        assert_eq!(parsed.mode, DialogueMode::Chat);
        assert!(!parsed.awaiting_confirmation);
        assert!(parsed.action.is_none());
        assert!(parsed.suggested_services.is_empty());
    }

    #[test]
    fn outcome_missing_success_counts_as_success() {
        let parsed: ActionOutcome =
            serde_json::from_value(serde_json::json!({"bookingId": "b-1"})).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.reference(), "b-1");
    }

    #[test]
    fn outcome_reference_prefers_booking_id() {
        let parsed: ActionOutcome = serde_json::from_value(serde_json::json!({
            "success": true,
            "bookingId": "b-1",
            "order_id": "o-1"
        }))
        .unwrap();
        assert_eq!(parsed.reference(), "b-1");

        let orders: ActionOutcome =
            serde_json::from_value(serde_json::json!({"order_id": "o-2"})).unwrap();
        assert_eq!(orders.reference(), "o-2");

        let none = ActionOutcome::failure("boom");
        assert_eq!(none.reference(), "N/A");
    }
}
