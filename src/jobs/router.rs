//! Action type → handler mapping and resource key resolution

use super::handler::JobHandler;
use super::job::{actions, Job};
use super::JobError;
use super::normalizer::canonical_action;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const OWNER_KEYS: &[&str] = &["repoOwner", "owner"];
const REPO_KEYS: &[&str] = &["repoName", "repo"];
const FULL_NAME_KEYS: &[&str] = &["repoFullName", "fullName"];
const REPO_URL_KEYS: &[&str] = &["repoUrl", "repositoryUrl", "repo_url", "gitUrl"];
const APP_NAME_KEYS: &[&str] = &["appName", "applicationName", "app_name"];
const DB_TYPE_KEYS: &[&str] = &["dbType", "databaseType", "db_type"];
const DB_NAME_KEYS: &[&str] = &["dbName", "databaseName", "name"];

/// Handler chosen for a job, plus the resource it must hold while running
pub struct Route {
    pub handler: Arc<dyn JobHandler>,
    pub resource_key: Option<String>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("resource_key", &self.resource_key)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct CommandRouter {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `action`, replacing any previous registration
    pub fn register(&mut self, action: &str, handler: Arc<dyn JobHandler>) {
        let action = canonical_action(action);
        debug!(action = %action, "Registered job handler");
        self.handlers.insert(action, handler);
    }

    pub fn supports(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered action types, sorted; advertised as capabilities
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.keys().cloned().collect();
        actions.sort();
        actions
    }

    pub fn resolve(&self, job: &Job) -> Result<Route, JobError> {
        let handler = self
            .handlers
            .get(&job.action_type)
            .cloned()
            .ok_or_else(|| JobError::Unsupported(job.action_type.clone()))?;

        Ok(Route {
            handler,
            resource_key: resource_key(job)?,
        })
    }
}

/// Exclusive-execution scope of `job`, if its action class needs one
pub fn resource_key(job: &Job) -> Result<Option<String>, JobError> {
    if job.is_deployment_class() {
        let (owner, repo) = repository_of(job).ok_or_else(|| {
            JobError::Malformed(format!(
                "job {} needs repoOwner/repoName, repoFullName or repoUrl",
                job.id
            ))
        })?;
        let app = job
            .param_str(APP_NAME_KEYS)
            .map(str::to_string)
            .unwrap_or_else(|| repo.clone());
        return Ok(Some(format!("{owner}/{repo}:{app}")));
    }

    if job.action_type == actions::INSTALL_DATABASE {
        let db_type = job.param_str(DB_TYPE_KEYS).ok_or_else(|| {
            JobError::Malformed(format!("job {} needs a dbType", job.id))
        })?;
        let key = match job.param_str(DB_NAME_KEYS) {
            Some(name) => format!("database:{db_type}:{name}"),
            None => format!("database:{db_type}"),
        };
        return Ok(Some(key));
    }

    Ok(None)
}

fn repository_of(job: &Job) -> Option<(String, String)> {
    if let (Some(owner), Some(repo)) = (job.param_str(OWNER_KEYS), job.param_str(REPO_KEYS)) {
        return Some((owner.to_string(), repo.to_string()));
    }
    if let Some(full) = job.param_str(FULL_NAME_KEYS) {
        return split_owner_repo(full);
    }
    job.param_str(REPO_URL_KEYS).and_then(owner_repo_from_url)
}

fn split_owner_repo(path: &str) -> Option<(String, String)> {
    let mut parts = path
        .trim_matches('/')
        .trim_end_matches(".git")
        .rsplitn(3, '/')
        .filter(|s| !s.is_empty());
    let repo = parts.next()?;
    let owner = parts.next()?;
    Some((owner.to_string(), repo.to_string()))
}

/// `https://host/owner/repo(.git)` or `git@host:owner/repo(.git)`
fn owner_repo_from_url(raw: &str) -> Option<(String, String)> {
    match url::Url::parse(raw) {
        Ok(parsed) if parsed.has_host() => split_owner_repo(parsed.path()),
        _ => raw
            .rsplit_once(':')
            .and_then(|(_, path)| split_owner_repo(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::JobEmitter;
    use crate::jobs::{HandlerError, Outcome};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn execute(&self, _job: &Job, _e: &JobEmitter) -> Result<Outcome, HandlerError> {
            Ok(Outcome::success("noop"))
        }
    }

    fn job(action: &str, params: Value) -> Job {
        Job {
            id: "j".to_string(),
            action_type: action.to_string(),
            parameters: params.as_object().cloned().unwrap_or_default(),
            server_id: "srv".to_string(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_unknown_action_is_unsupported() {
        let router = CommandRouter::new();
        let err = router.resolve(&job("reboot_host", json!({}))).unwrap_err();
        assert_eq!(err, JobError::Unsupported("reboot_host".to_string()));
    }

    #[test]
    fn test_register_canonicalizes_action() {
        let mut router = CommandRouter::new();
        router.register("deploy", Arc::new(Noop));
        router.register("healthCheck", Arc::new(Noop));
        assert!(router.supports("deploy_application"));
        assert_eq!(router.actions(), vec!["deploy_application", "health_check"]);
    }

    #[test]
    fn test_deployment_key_from_owner_and_repo() {
        let key = resource_key(&job(
            "deploy_application",
            json!({"repoOwner": "acme", "repoName": "site", "appName": "web"}),
        ))
        .unwrap();
        assert_eq!(key.as_deref(), Some("acme/site:web"));
    }

    #[test]
    fn test_deployment_key_from_full_name_and_url() {
        let from_full = resource_key(&job(
            "restart_application",
            json!({"repoFullName": "acme/site", "appName": "web"}),
        ))
        .unwrap();
        assert_eq!(from_full.as_deref(), Some("acme/site:web"));

        let from_https = resource_key(&job(
            "deploy_application",
            json!({"repoUrl": "https://github.com/acme/site.git", "appName": "web"}),
        ))
        .unwrap();
        assert_eq!(from_https.as_deref(), Some("acme/site:web"));

        let from_ssh = resource_key(&job(
            "deploy_application",
            json!({"repoUrl": "git@github.com:acme/site.git"}),
        ))
        .unwrap();
        assert_eq!(from_ssh.as_deref(), Some("acme/site:site"));
    }

    #[test]
    fn test_deployment_without_repository_is_malformed() {
        let err = resource_key(&job("deploy_application", json!({"appName": "web"}))).unwrap_err();
        assert!(matches!(err, JobError::Malformed(_)));
    }

    #[test]
    fn test_database_key() {
        assert_eq!(
            resource_key(&job("install_database", json!({"dbType": "postgres"})))
                .unwrap()
                .as_deref(),
            Some("database:postgres")
        );
        assert_eq!(
            resource_key(&job(
                "install_database",
                json!({"dbType": "mysql", "dbName": "orders"})
            ))
            .unwrap()
            .as_deref(),
            Some("database:mysql:orders")
        );
    }

    #[test]
    fn test_lock_free_actions_have_no_key() {
        assert_eq!(
            resource_key(&job("inspect_repository", json!({"repoUrl": "x"}))).unwrap(),
            None
        );
    }

    #[test]
    fn test_resolve_carries_key() {
        let mut router = CommandRouter::new();
        router.register("deploy_application", Arc::new(Noop));
        let route = router
            .resolve(&job(
                "deploy_application",
                json!({"owner": "acme", "repo": "site", "appName": "web"}),
            ))
            .unwrap();
        assert_eq!(route.resource_key.as_deref(), Some("acme/site:web"));
    }
}
