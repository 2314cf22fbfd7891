//! Canonical job record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Action types with built-in meaning to the dispatch layer
pub mod actions {
    pub const DEPLOY_APPLICATION: &str = "deploy_application";
    pub const REDEPLOY_APPLICATION: &str = "redeploy_application";
    pub const ROLLBACK_APPLICATION: &str = "rollback_application";
    pub const RESTART_APPLICATION: &str = "restart_application";
    pub const STOP_APPLICATION: &str = "stop_application";
    pub const REMOVE_APPLICATION: &str = "remove_application";
    pub const INSTALL_DATABASE: &str = "install_database";
    pub const INSPECT_REPOSITORY: &str = "inspect_repository";
    pub const HEALTH_CHECK: &str = "health_check";

    /// Actions that mutate one deployed application and must not overlap
    pub const DEPLOYMENT_CLASS: &[&str] = &[
        DEPLOY_APPLICATION,
        REDEPLOY_APPLICATION,
        ROLLBACK_APPLICATION,
        RESTART_APPLICATION,
        STOP_APPLICATION,
        REMOVE_APPLICATION,
    ];
}

/// One unit of work, independent of the transport that delivered it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub action_type: String,
    pub parameters: Map<String, Value>,
    pub server_id: String,
    pub received_at: DateTime<Utc>,
}

impl Job {
    /// First non-empty string parameter found under any of `keys`
    pub fn param_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| {
            self.parameters
                .get(*key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })
    }

    pub fn is_deployment_class(&self) -> bool {
        actions::DEPLOYMENT_CLASS.contains(&self.action_type.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(action: &str, parameters: Value) -> Job {
        Job {
            id: "j-1".to_string(),
            action_type: action.to_string(),
            parameters: parameters.as_object().cloned().unwrap_or_default(),
            server_id: "srv-1".to_string(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_param_str_takes_first_non_empty_alias() {
        let job = job(
            actions::DEPLOY_APPLICATION,
            json!({"repoOwner": "  ", "owner": "acme", "port": 8080}),
        );
        assert_eq!(job.param_str(&["repoOwner", "owner"]), Some("acme"));
        assert_eq!(job.param_str(&["port"]), None);
        assert_eq!(job.param_str(&["missing"]), None);
    }

    #[test]
    fn test_deployment_class() {
        assert!(job(actions::ROLLBACK_APPLICATION, json!({})).is_deployment_class());
        assert!(!job(actions::INSTALL_DATABASE, json!({})).is_deployment_class());
    }

    #[test]
    fn test_serializes_camel_case() {
        let value = serde_json::to_value(job(actions::HEALTH_CHECK, json!({}))).unwrap();
        assert_eq!(value["actionType"], "health_check");
        assert_eq!(value["serverId"], "srv-1");
        assert!(value.get("receivedAt").is_some());
    }
}
