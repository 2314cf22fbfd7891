//! Inbound payload normalization
//!
//! Control-plane versions disagree on field names. Every alias is resolved
//! here and nowhere else, so the router and handlers only ever see a
//! canonical [`Job`].

use super::job::{actions, Job};
use super::JobError;
use chrono::Utc;
use serde_json::{Map, Value};

const ID_KEYS: &[&str] = &["id", "jobId", "_id"];
const ACTION_KEYS: &[&str] = &["actionType", "jobType", "type", "command"];
const PARAM_KEYS: &[&str] = &["parameters", "params", "payload", "data"];
const SERVER_KEYS: &[&str] = &["serverId", "server_id", "agentId"];
const NESTED_JOB_KEY: &str = "job";

const DB_TYPE_KEYS: &[&str] = &["dbType", "databaseType", "db_type"];
const APP_NAME_KEYS: &[&str] = &["appName", "applicationName", "app_name"];
const REPO_URL_KEYS: &[&str] = &["repoUrl", "repositoryUrl", "repo_url", "gitUrl"];
const OWNER_KEYS: &[&str] = &["repoOwner", "owner"];
const REPO_KEYS: &[&str] = &["repoName", "repo"];

/// Legacy action spellings mapped onto canonical action types
const ACTION_ALIASES: &[(&str, &str)] = &[
    ("deploy", actions::DEPLOY_APPLICATION),
    ("deploy_app", actions::DEPLOY_APPLICATION),
    ("redeploy", actions::REDEPLOY_APPLICATION),
    ("rollback", actions::ROLLBACK_APPLICATION),
    ("restart", actions::RESTART_APPLICATION),
    ("restart_app", actions::RESTART_APPLICATION),
    ("stop", actions::STOP_APPLICATION),
    ("stop_app", actions::STOP_APPLICATION),
    ("remove", actions::REMOVE_APPLICATION),
    ("delete_application", actions::REMOVE_APPLICATION),
    ("install_db", actions::INSTALL_DATABASE),
    ("create_database", actions::INSTALL_DATABASE),
    ("database_install", actions::INSTALL_DATABASE),
    ("inspect_repo", actions::INSPECT_REPOSITORY),
    ("analyze_repository", actions::INSPECT_REPOSITORY),
    ("ping", actions::HEALTH_CHECK),
    ("health", actions::HEALTH_CHECK),
];

/// Turns raw inbound mappings into canonical jobs for one agent
#[derive(Debug, Clone)]
pub struct JobNormalizer {
    server_id: String,
}

impl JobNormalizer {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn normalize(&self, raw: &Value) -> Result<Job, JobError> {
        let object = job_object(raw)?;

        let id = extract_id(object)
            .ok_or_else(|| JobError::Malformed("missing job id (id, jobId or _id)".to_string()))?;

        let parameters = extract_parameters(object);

        let action_type = match first_str(object, ACTION_KEYS) {
            Some(action) => canonical_action(action),
            None => infer_action(object, &parameters).ok_or_else(|| {
                JobError::Malformed(format!("job {id} has no identifiable action type"))
            })?,
        };

        let server_id = match first_str(object, SERVER_KEYS) {
            Some(target) if target != self.server_id => {
                return Err(JobError::Malformed(format!(
                    "job {id} is addressed to server {target}, not {}",
                    self.server_id
                )));
            }
            _ => self.server_id.clone(),
        };

        Ok(Job {
            id,
            action_type,
            parameters,
            server_id,
            received_at: Utc::now(),
        })
    }
}

/// Best-effort job id, used to report a failure for payloads that do not normalize
pub fn extract_job_id(raw: &Value) -> Option<String> {
    job_object(raw).ok().and_then(extract_id)
}

fn job_object(raw: &Value) -> Result<&Map<String, Value>, JobError> {
    let object = raw
        .as_object()
        .ok_or_else(|| JobError::Malformed("payload is not a JSON object".to_string()))?;

    // `{ "job": { ... } }` wrappers carry the job one level down
    if extract_id(object).is_none() {
        if let Some(Value::Object(inner)) = object.get(NESTED_JOB_KEY) {
            return Ok(inner);
        }
    }
    Ok(object)
}

fn extract_id(object: &Map<String, Value>) -> Option<String> {
    ID_KEYS.iter().find_map(|key| match object.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn first_str<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| {
        object
            .get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    })
}

fn extract_parameters(object: &Map<String, Value>) -> Map<String, Value> {
    if let Some(nested) = PARAM_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_object))
    {
        return nested.clone();
    }

    object
        .iter()
        .filter(|(key, _)| {
            let key = key.as_str();
            !ID_KEYS.contains(&key) && !ACTION_KEYS.contains(&key) && !SERVER_KEYS.contains(&key)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Lower snake case plus legacy alias resolution
pub fn canonical_action(raw: &str) -> String {
    let mut snake = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for ch in raw.trim().chars() {
        if ch == '-' || ch == ' ' || ch == '.' {
            snake.push('_');
            prev_lower = false;
        } else if ch.is_uppercase() {
            if prev_lower {
                snake.push('_');
            }
            snake.extend(ch.to_lowercase());
            prev_lower = false;
        } else {
            snake.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }

    ACTION_ALIASES
        .iter()
        .find(|(alias, _)| *alias == snake)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(snake)
}

/// Guess the action from the shape of the payload when no action field exists
fn infer_action(object: &Map<String, Value>, parameters: &Map<String, Value>) -> Option<String> {
    let has = |keys: &[&str]| first_str(parameters, keys).or(first_str(object, keys)).is_some();

    if has(DB_TYPE_KEYS) {
        return Some(actions::INSTALL_DATABASE.to_string());
    }
    let has_repo = has(REPO_URL_KEYS) || (has(OWNER_KEYS) && has(REPO_KEYS));
    if has(APP_NAME_KEYS) && has_repo {
        return Some(actions::DEPLOY_APPLICATION.to_string());
    }
    if has(REPO_URL_KEYS) {
        return Some(actions::INSPECT_REPOSITORY.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer() -> JobNormalizer {
        JobNormalizer::new("srv-1")
    }

    #[test]
    fn test_id_aliases() {
        for raw in [
            json!({"id": "a", "actionType": "deploy_application"}),
            json!({"jobId": "a", "actionType": "deploy_application"}),
            json!({"_id": "a", "actionType": "deploy_application"}),
        ] {
            assert_eq!(normalizer().normalize(&raw).unwrap().id, "a");
        }
    }

    #[test]
    fn test_numeric_id_is_stringified() {
        let job = normalizer()
            .normalize(&json!({"id": 42, "command": "health_check"}))
            .unwrap();
        assert_eq!(job.id, "42");
    }

    #[test]
    fn test_action_aliases_are_canonicalized() {
        let cases = [
            ("deploy", "deploy_application"),
            ("deployApplication", "deploy_application"),
            ("install-db", "install_database"),
            ("INSTALL_DATABASE", "install_database"),
            ("inspectRepository", "inspect_repository"),
            ("ping", "health_check"),
        ];
        for (raw, expected) in cases {
            assert_eq!(canonical_action(raw), expected, "raw: {raw}");
        }
    }

    #[test]
    fn test_nested_parameters_preferred() {
        let job = normalizer()
            .normalize(&json!({
                "jobId": "j1",
                "jobType": "deploy",
                "payload": {"appName": "web", "owner": "acme", "repo": "site"},
                "priority": "high"
            }))
            .unwrap();
        assert_eq!(job.action_type, "deploy_application");
        assert_eq!(job.parameters["appName"], "web");
        assert!(job.parameters.get("priority").is_none());
    }

    #[test]
    fn test_flat_parameters_exclude_envelope_keys() {
        let job = normalizer()
            .normalize(&json!({
                "id": "j2",
                "type": "restart_application",
                "serverId": "srv-1",
                "appName": "api"
            }))
            .unwrap();
        assert_eq!(job.parameters.len(), 1);
        assert_eq!(job.parameters["appName"], "api");
    }

    #[test]
    fn test_inference_from_payload_shape() {
        let db = normalizer()
            .normalize(&json!({"id": "1", "dbType": "postgres"}))
            .unwrap();
        assert_eq!(db.action_type, "install_database");

        let deploy = normalizer()
            .normalize(&json!({"id": "2", "data": {"appName": "web", "repoUrl": "https://github.com/acme/web"}}))
            .unwrap();
        assert_eq!(deploy.action_type, "deploy_application");

        let inspect = normalizer()
            .normalize(&json!({"id": "3", "repoUrl": "https://github.com/acme/web"}))
            .unwrap();
        assert_eq!(inspect.action_type, "inspect_repository");
    }

    #[test]
    fn test_missing_id_is_malformed() {
        let err = normalizer()
            .normalize(&json!({"actionType": "deploy_application"}))
            .unwrap_err();
        assert!(matches!(err, JobError::Malformed(_)));
    }

    #[test]
    fn test_blank_id_is_malformed() {
        assert!(normalizer()
            .normalize(&json!({"id": "   ", "command": "health_check"}))
            .is_err());
    }

    #[test]
    fn test_unresolvable_action_is_malformed() {
        let err = normalizer()
            .normalize(&json!({"id": "j", "something": "else"}))
            .unwrap_err();
        assert!(matches!(err, JobError::Malformed(ref m) if m.contains("action")));
    }

    #[test]
    fn test_foreign_server_id_is_malformed() {
        let err = normalizer()
            .normalize(&json!({"id": "j", "command": "deploy", "serverId": "srv-2"}))
            .unwrap_err();
        assert!(matches!(err, JobError::Malformed(_)));
    }

    #[test]
    fn test_nested_job_wrapper() {
        let raw = json!({"job": {"_id": "n1", "actionType": "health_check"}});
        assert_eq!(normalizer().normalize(&raw).unwrap().id, "n1");
        assert_eq!(extract_job_id(&raw).as_deref(), Some("n1"));
    }

    #[test]
    fn test_non_object_payload() {
        assert!(normalizer().normalize(&json!(["deploy"])).is_err());
        assert_eq!(extract_job_id(&json!("x")), None);
    }
}
