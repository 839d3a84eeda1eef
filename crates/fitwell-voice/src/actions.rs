//! **Action Executor** — run a confirmed service action against the booking
//! backend, or a deterministic mock when no backend is configured.
//!
//! The mock path simulates a short backend delay and synthesizes a fresh
//! reference id, so the whole conversational loop can be exercised end to end
//! offline. An unrecognized action kind is an explicit unsupported failure,
//! never routed.

use crate::config::AssistantConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::types::{ActionKind, ActionOutcome, ServiceAction};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

/// Backend that executes service actions.
#[async_trait]
pub trait ActionBackend: Send + Sync {
    async fn execute(&self, action: &ServiceAction) -> VoiceResult<ActionOutcome>;
}

/// HTTP action client with a built-in mock fallback when unconfigured.
pub struct HttpActionClient {
    base_url: Option<String>,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpActionClient {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            api_key,
            client,
        }
    }

    pub fn from_config(config: &AssistantConfig) -> Self {
        Self::new(
            config.actions_base_url.clone(),
            config.actions_api_key.clone(),
        )
    }

    async fn post(&self, base: &str, path: &str, params: &Value) -> ActionOutcome {
        let url = format!("{}{}", base.trim_end_matches('/'), path);
        let mut req = self.client.post(&url).json(params);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(res) => match res.json::<ActionOutcome>().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("action response did not parse: {}", e);
                    ActionOutcome::failure(e.to_string())
                }
            },
            Err(e) => {
                warn!("action request failed: {}", e);
                ActionOutcome::failure(e.to_string())
            }
        }
    }

    fn param<'a>(params: &'a Value, key: &str) -> Option<&'a Value> {
        params.get(key).filter(|v| !v.is_null())
    }

    async fn book_doctor(&self, params: Value) -> ActionOutcome {
        if let Some(ref base) = self.base_url {
            return self.post(base, "/bookings/doctor", &params).await;
        }
        tokio::time::sleep(Duration::from_millis(700)).await;
        ActionOutcome {
            success: true,
            booking_id: Some(format!("mock-doc-{}", Utc::now().timestamp_millis())),
            order_id: None,
            details: Some(serde_json::json!({
                "doctor": Self::param(&params, "doctor").cloned()
                    .unwrap_or_else(|| Value::from("General Physician")),
                "time": Self::param(&params, "time").cloned()
                    .unwrap_or_else(|| Value::from("Tomorrow, 10:00 AM")),
                "location": Self::param(&params, "location").cloned()
                    .unwrap_or_else(|| Value::from("Fitwell Clinic - Downtown")),
            })),
            error: None,
        }
    }

    async fn book_lab(&self, params: Value) -> ActionOutcome {
        if let Some(ref base) = self.base_url {
            return self.post(base, "/bookings/lab", &params).await;
        }
        tokio::time::sleep(Duration::from_millis(700)).await;
        ActionOutcome {
            success: true,
            booking_id: Some(format!("mock-lab-{}", Utc::now().timestamp_millis())),
            order_id: None,
            details: Some(serde_json::json!({
                "tests": Self::param(&params, "tests").cloned()
                    .unwrap_or_else(|| serde_json::json!(["CBC"])),
                "time": Self::param(&params, "time").cloned()
                    .unwrap_or_else(|| Value::from("Tomorrow, 9:00 AM")),
                "location": Self::param(&params, "location").cloned()
                    .unwrap_or_else(|| Value::from("Fitwell Lab - Uptown")),
            })),
            error: None,
        }
    }

    async fn order_medicine(&self, params: Value) -> ActionOutcome {
        if let Some(ref base) = self.base_url {
            return self.post(base, "/orders/medicine", &params).await;
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        ActionOutcome {
            success: true,
            booking_id: None,
            order_id: Some(format!("mock-med-{}", Utc::now().timestamp_millis())),
            details: Some(serde_json::json!({
                "items": Self::param(&params, "items").cloned()
                    .unwrap_or_else(|| serde_json::json!([])),
                "eta": "2 business days",
                "pharmacy": "Fitwell Pharmacy - Central",
            })),
            error: None,
        }
    }
}

#[async_trait]
impl ActionBackend for HttpActionClient {
    async fn execute(&self, action: &ServiceAction) -> VoiceResult<ActionOutcome> {
        let params = serde_json::to_value(&action.params)
            .map_err(|e| VoiceError::Action(e.to_string()))?;
        info!("executing action {:?}", action.kind);
        let outcome = match action.kind {
            ActionKind::BookDoctor => self.book_doctor(params).await,
            ActionKind::BookLab => self.book_lab(params).await,
            ActionKind::OrderMedicine => self.order_medicine(params).await,
            ActionKind::Other => ActionOutcome::failure("Unknown action type"),
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_client() -> HttpActionClient {
        HttpActionClient::new(None, None)
    }

    #[tokio::test]
    async fn mock_doctor_booking_succeeds_with_defaults() {
        let action = ServiceAction::new(ActionKind::BookDoctor);
        let outcome = mock_client().execute(&action).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.reference().starts_with("mock-doc-"));
        let details = outcome.details.unwrap();
        assert_eq!(details["doctor"], "General Physician");
    }

    #[tokio::test]
    async fn mock_lab_booking_echoes_params() {
        let action = ServiceAction::new(ActionKind::BookLab)
            .with_param("tests", serde_json::json!(["CBC", "LFT"]));
        let outcome = mock_client().execute(&action).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.reference().starts_with("mock-lab-"));
        assert_eq!(
            outcome.details.unwrap()["tests"],
            serde_json::json!(["CBC", "LFT"])
        );
    }

    #[tokio::test]
    async fn mock_medicine_order_uses_order_id() {
        let action = ServiceAction::new(ActionKind::OrderMedicine);
        let outcome = mock_client().execute(&action).await.unwrap();
        assert!(outcome.booking_id.is_none());
        assert!(outcome.reference().starts_with("mock-med-"));
    }

    #[tokio::test]
    async fn unknown_action_kind_is_not_routed() {
        let action = ServiceAction::new(ActionKind::Other);
        let outcome = mock_client().execute(&action).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Unknown action type"));
    }
}
