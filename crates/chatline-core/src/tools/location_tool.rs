use async_trait::async_trait;
use rig::completion::ToolDefinition;
use serde::{Deserialize, Serialize};

use super::{ToolError, ToolHandler, ToolPolicy};

/// The human's answer to a location request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LocationDecision {
    Granted {
        latitude: f64,
        longitude: f64,
        timezone: String,
    },
    Denied {
        reason: String,
    },
}

impl LocationDecision {
    pub fn denied(reason: impl Into<String>) -> Self {
        LocationDecision::Denied {
            reason: reason.into(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Asks the user to share their location. Never runs on its own: the
/// generation suspends until the client supplies a `LocationDecision`.
#[derive(Clone, Default)]
pub struct LocationTool;

impl LocationTool {
    pub const NAME: &'static str = "get_user_location";

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolHandler for LocationTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Ask the user for their current location. Returns coordinates and \
                          timezone if the user agrees, or the reason they declined."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "purpose": {
                        "type": "string",
                        "description": "Why the location is needed, shown to the user"
                    }
                }
            }),
        }
    }

    fn policy(&self) -> ToolPolicy {
        ToolPolicy::RequiresConfirmation
    }

    async fn execute(&self, _args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        Err(ToolError::NeedsConfirmation(Self::NAME.to_string()))
    }

    fn accept_decision(&self, decision: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let decision: LocationDecision = serde_json::from_value(decision)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        if let LocationDecision::Granted {
            latitude,
            longitude,
            ..
        } = &decision
        {
            if !(-90.0..=90.0).contains(latitude) || !(-180.0..=180.0).contains(longitude) {
                return Err(ToolError::InvalidArguments(format!(
                    "coordinates out of range: {latitude}, {longitude}"
                )));
            }
        }

        Ok(decision.to_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_denial_round_trips() {
        let tool = LocationTool::new();
        let value = tool
            .accept_decision(LocationDecision::denied("user declined").to_value())
            .unwrap();
        assert_eq!(value, json!({"status": "denied", "reason": "user declined"}));
    }

    #[test]
    fn test_grant_is_validated() {
        let tool = LocationTool::new();
        let ok = tool.accept_decision(json!({
            "status": "granted",
            "latitude": 52.37,
            "longitude": 4.89,
            "timezone": "Europe/Amsterdam"
        }));
        assert!(ok.is_ok());

        let bad = tool.accept_decision(json!({
            "status": "granted",
            "latitude": 120.0,
            "longitude": 4.89,
            "timezone": "UTC"
        }));
        assert!(matches!(bad, Err(ToolError::InvalidArguments(_))));
    }

    #[test]
    fn test_malformed_decision_is_rejected() {
        let tool = LocationTool::new();
        assert!(tool.accept_decision(json!({"status": "maybe"})).is_err());
    }

    #[tokio::test]
    async fn test_never_executes_on_its_own() {
        let err = LocationTool::new().execute(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NeedsConfirmation(_)));
    }
}
