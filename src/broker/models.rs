//! OSBAPI request and response bodies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BrokerError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MaintenanceInfoRef {
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvisionDetails {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub organization_guid: String,
    #[serde(default)]
    pub space_guid: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub maintenance_info: Option<MaintenanceInfoRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreviousValues {
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub space_id: String,
    #[serde(default)]
    pub maintenance_info: Option<MaintenanceInfoRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateDetails {
    pub service_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub previous_values: PreviousValues,
    #[serde(default)]
    pub maintenance_info: Option<MaintenanceInfoRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BindResource {
    #[serde(default)]
    pub app_guid: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BindDetails {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub app_guid: String,
    #[serde(default)]
    pub bind_resource: Option<BindResource>,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub parameters: Option<Value>,
}

impl BindDetails {
    pub fn app_guid(&self) -> String {
        match &self.bind_resource {
            Some(r) if !r.app_guid.is_empty() => r.app_guid.clone(),
            _ => self.app_guid.clone(),
        }
    }
}

/// Query parameters shared by deprovision and unbind.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteDetails {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub operation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastOperationResponse {
    pub state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingResponse {
    pub credentials: Map<String, Value>,
}

/// Parse raw `parameters` into a JSON object; absent and `null` mean empty.
pub fn parse_parameters(raw: Option<&Value>) -> Result<Map<String, Value>, BrokerError> {
    match raw {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(obj)) => Ok(obj.clone()),
        Some(_) => Err(invalid_user_input()),
    }
}

pub fn invalid_user_input() -> BrokerError {
    BrokerError::Validation("User supplied parameters must be in the form of a valid JSON map.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parameters_must_be_an_object() {
        assert!(parse_parameters(None).unwrap().is_empty());
        assert!(parse_parameters(Some(&Value::Null)).unwrap().is_empty());
        assert_eq!(parse_parameters(Some(&json!({"a": 1}))).unwrap()["a"], 1);
        let err = parse_parameters(Some(&json!([1, 2]))).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn bind_resource_app_guid_wins() {
        let d: BindDetails = serde_json::from_value(json!({
            "service_id": "s", "plan_id": "p", "app_guid": "old",
            "bind_resource": {"app_guid": "new"}
        }))
        .unwrap();
        assert_eq!(d.app_guid(), "new");
    }
}
