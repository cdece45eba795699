//! Resource-scoped permission cache.
//!
//! Permission lists are fetched per resource (or batched) from the
//! authorization service and cached under the canonical resource key.
//! Entries are identity-bound: the owning session drops the whole cache on
//! sign-out or any session-invalidating failure.

use std::collections::HashMap;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::resource::{Resource, make_resource_key};

/// Path of the permission endpoint under the authorization service URL.
pub const PERMISSIONS_PATH: &str = "/policy/permissions";

// Well-known permission names understood by the authorization service.
pub const QUERY_PROJECT_LEVEL_BOOLEAN: &str = "query:project_level_boolean";
pub const QUERY_DATASET_LEVEL_BOOLEAN: &str = "query:dataset_level_boolean";
pub const QUERY_PROJECT_LEVEL_COUNTS: &str = "query:project_level_counts";
pub const QUERY_DATASET_LEVEL_COUNTS: &str = "query:dataset_level_counts";
pub const QUERY_DATA: &str = "query:data";
pub const DOWNLOAD_DATA: &str = "download:data";
pub const DELETE_DATA: &str = "delete:data";
pub const INGEST_DATA: &str = "ingest:data";
pub const ANALYZE_DATA: &str = "analyze:data";
pub const EXPORT_DATA: &str = "export:data";
pub const VIEW_RUNS: &str = "view:runs";
pub const CREATE_PROJECT: &str = "create:project";
pub const EDIT_PROJECT: &str = "edit:project";
pub const DELETE_PROJECT: &str = "delete:project";
pub const CREATE_DATASET: &str = "create:dataset";
pub const EDIT_DATASET: &str = "edit:dataset";
pub const DELETE_DATASET: &str = "delete:dataset";
pub const VIEW_PERMISSIONS: &str = "view:permissions";
pub const EDIT_PERMISSIONS: &str = "edit:permissions";
pub const VIEW_DROP_BOX: &str = "view:drop_box";
pub const INGEST_DROP_BOX: &str = "ingest:drop_box";
pub const DELETE_DROP_BOX: &str = "delete:drop_box";
pub const INGEST_REFERENCE_MATERIAL: &str = "ingest:reference_material";
pub const DELETE_REFERENCE_MATERIAL: &str = "delete:reference_material";

/// Cached permission state for one resource key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePermissions {
    /// Grants in the order the authorization service returned them.
    pub permissions: Vec<String>,
    pub is_fetching: bool,
    pub has_attempted: bool,
    /// Empty when the last attempt (if any) succeeded.
    pub error: String,
}

/// How a batch fetch request resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The batch was fetched and entries updated.
    Fetched,
    /// The request failed; every entry in the batch records the error.
    Failed,
    /// At least one resource in the batch was already mid-fetch, so the
    /// whole batch call was skipped.
    SkippedInFlight,
}

#[derive(Debug, Deserialize)]
struct PermissionsResponse {
    /// One permission list per requested resource, positionally aligned.
    result: Vec<Vec<String>>,
}

/// Permission cache keyed by canonical resource fingerprint.
///
/// At most one fetch per key is in flight at a time; failures are recorded on
/// the affected entries and never touch session validity.
#[derive(Debug)]
pub struct PermissionCache {
    http: reqwest::Client,
    entries: RwLock<HashMap<String, ResourcePermissions>>,
}

impl PermissionCache {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Current state for a resource (default empty entry if never seen).
    pub async fn snapshot(&self, resource: &Resource) -> ResourcePermissions {
        let key = make_resource_key(resource);
        self.entries.read().await.get(&key).cloned().unwrap_or_default()
    }

    /// Drop every cached entry. Called by the session on any transition that
    /// invalidates the access token's identity.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Fetch permissions for a batch of resources.
    ///
    /// If any resource in the batch is already mid-fetch the entire call is
    /// skipped — callers needing independent control issue single-resource
    /// calls. On failure every requested resource records the same error.
    pub async fn fetch(
        &self,
        resources: &[Resource],
        authz_url: &str,
        access_token: Option<&str>,
    ) -> FetchOutcome {
        if resources.is_empty() {
            return FetchOutcome::Fetched;
        }
        let keys: Vec<String> = resources.iter().map(make_resource_key).collect();

        {
            let mut entries = self.entries.write().await;
            if keys
                .iter()
                .any(|k| entries.get(k).is_some_and(|e| e.is_fetching))
            {
                debug!("permission fetch skipped: batch member already in flight");
                return FetchOutcome::SkippedInFlight;
            }
            for key in &keys {
                entries.insert(
                    key.clone(),
                    ResourcePermissions {
                        permissions: Vec::new(),
                        is_fetching: true,
                        has_attempted: false,
                        error: String::new(),
                    },
                );
            }
        }

        match self.request(resources, authz_url, access_token).await {
            Ok(result) if result.len() == keys.len() => {
                let mut entries = self.entries.write().await;
                for (key, permissions) in keys.iter().zip(result) {
                    entries.insert(
                        key.clone(),
                        ResourcePermissions {
                            permissions,
                            is_fetching: false,
                            has_attempted: true,
                            error: String::new(),
                        },
                    );
                }
                FetchOutcome::Fetched
            }
            Ok(result) => {
                let message = format!(
                    "authorization service returned {} permission lists for {} resources",
                    result.len(),
                    keys.len()
                );
                self.record_failure(&keys, &message).await;
                FetchOutcome::Failed
            }
            Err(message) => {
                self.record_failure(&keys, &message).await;
                FetchOutcome::Failed
            }
        }
    }

    /// Fetch a single resource's permissions unless an attempt already
    /// happened or is in flight.
    pub async fn fetch_if_needed(
        &self,
        resource: &Resource,
        authz_url: &str,
        access_token: Option<&str>,
    ) -> FetchOutcome {
        if authz_url.is_empty() {
            return FetchOutcome::SkippedInFlight;
        }
        {
            let key = make_resource_key(resource);
            let entries = self.entries.read().await;
            if entries
                .get(&key)
                .is_some_and(|e| e.is_fetching || e.has_attempted)
            {
                return FetchOutcome::SkippedInFlight;
            }
        }
        self.fetch(std::slice::from_ref(resource), authz_url, access_token)
            .await
    }

    /// Whether the user holds `permission` on `resource`, fetching the
    /// resource's grants first if they were never attempted.
    pub async fn has_permission(
        &self,
        resource: &Resource,
        authz_url: &str,
        access_token: Option<&str>,
        permission: &str,
    ) -> bool {
        self.fetch_if_needed(resource, authz_url, access_token).await;
        self.snapshot(resource)
            .await
            .permissions
            .iter()
            .any(|p| p == permission)
    }

    async fn request(
        &self,
        resources: &[Resource],
        authz_url: &str,
        access_token: Option<&str>,
    ) -> std::result::Result<Vec<Vec<String>>, String> {
        let url = format!("{authz_url}{PERMISSIONS_PATH}");
        let mut request = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "resources": resources }));
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("permission fetch failed with HTTP {status}"));
        }
        response
            .json::<PermissionsResponse>()
            .await
            .map(|r| r.result)
            .map_err(|e| format!("malformed permissions response: {e}"))
    }

    async fn record_failure(&self, keys: &[String], message: &str) {
        warn!(err = %message, resources = keys.len(), "permission fetch failed");
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.insert(
                key.clone(),
                ResourcePermissions {
                    permissions: Vec::new(),
                    is_fetching: false,
                    has_attempted: true,
                    error: message.to_string(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::project;
    use axum::routing::post;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn authz_app(hits: Arc<AtomicUsize>, delay: Duration) -> axum::Router {
        axum::Router::new().route(
            PERMISSIONS_PATH,
            post(
                move |headers: axum::http::HeaderMap, axum::Json(body): axum::Json<serde_json::Value>| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(
                            headers.get("authorization").unwrap().to_str().unwrap(),
                            "Bearer AT1"
                        );
                        tokio::time::sleep(delay).await;
                        let n = body["resources"].as_array().unwrap().len();
                        let result: Vec<Vec<&str>> = (0..n).map(|_| vec![VIEW_RUNS]).collect();
                        axum::Json(serde_json::json!({ "result": result }))
                    }
                },
            ),
        )
    }

    #[tokio::test]
    async fn fetch_populates_entry_from_positional_result() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(authz_app(Arc::clone(&hits), Duration::ZERO)).await;

        let cache = PermissionCache::new(reqwest::Client::new());
        let resource = project("p1");
        let outcome = cache
            .fetch(std::slice::from_ref(&resource), &base, Some("AT1"))
            .await;
        assert_eq!(outcome, FetchOutcome::Fetched);

        let entry = cache.snapshot(&resource).await;
        assert_eq!(entry.permissions, vec![VIEW_RUNS.to_string()]);
        assert!(entry.has_attempted);
        assert!(!entry.is_fetching);
        assert_eq!(entry.error, "");
    }

    #[tokio::test]
    async fn concurrent_fetches_for_same_key_issue_one_request() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(authz_app(Arc::clone(&hits), Duration::from_millis(200))).await;

        let cache = Arc::new(PermissionCache::new(reqwest::Client::new()));
        let resource = project("p1");

        let first = {
            let cache = Arc::clone(&cache);
            let resource = resource.clone();
            let base = base.clone();
            tokio::spawn(async move {
                cache
                    .fetch(std::slice::from_ref(&resource), &base, Some("AT1"))
                    .await
            })
        };
        // Give the first call time to mark the entry in-flight.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = cache
            .fetch(std::slice::from_ref(&resource), &base, Some("AT1"))
            .await;

        assert_eq!(second, FetchOutcome::SkippedInFlight);
        assert_eq!(first.await.unwrap(), FetchOutcome::Fetched);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_skipped_whole_when_any_member_in_flight() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(authz_app(Arc::clone(&hits), Duration::from_millis(200))).await;

        let cache = Arc::new(PermissionCache::new(reqwest::Client::new()));
        let in_flight = project("p1");

        let first = {
            let cache = Arc::clone(&cache);
            let resource = in_flight.clone();
            let base = base.clone();
            tokio::spawn(async move {
                cache
                    .fetch(std::slice::from_ref(&resource), &base, Some("AT1"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // p2 is idle, but the batch shares p1 which is mid-fetch.
        let batch = [project("p2"), project("p1")];
        let outcome = cache.fetch(&batch, &base, Some("AT1")).await;
        assert_eq!(outcome, FetchOutcome::SkippedInFlight);
        // p2 was not marked attempted by the skipped batch.
        assert!(!cache.snapshot(&project("p2")).await.has_attempted);

        first.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_failure_marks_every_member() {
        let app = axum::Router::new().route(
            PERMISSIONS_PATH,
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let base = serve(app).await;

        let cache = PermissionCache::new(reqwest::Client::new());
        let batch = [project("p1"), project("p2")];
        let outcome = cache.fetch(&batch, &base, Some("AT1")).await;
        assert_eq!(outcome, FetchOutcome::Failed);

        for resource in &batch {
            let entry = cache.snapshot(resource).await;
            assert!(entry.has_attempted);
            assert!(!entry.is_fetching);
            assert!(entry.error.contains("500"));
            assert!(entry.permissions.is_empty());
        }
    }

    #[tokio::test]
    async fn fetch_if_needed_skips_after_attempt() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(authz_app(Arc::clone(&hits), Duration::ZERO)).await;

        let cache = PermissionCache::new(reqwest::Client::new());
        let resource = project("p1");

        assert_eq!(
            cache.fetch_if_needed(&resource, &base, Some("AT1")).await,
            FetchOutcome::Fetched
        );
        assert_eq!(
            cache.fetch_if_needed(&resource, &base, Some("AT1")).await,
            FetchOutcome::SkippedInFlight
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn has_permission_checks_fetched_grants() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(authz_app(Arc::clone(&hits), Duration::ZERO)).await;

        let cache = PermissionCache::new(reqwest::Client::new());
        let resource = project("p1");

        assert!(
            cache
                .has_permission(&resource, &base, Some("AT1"), VIEW_RUNS)
                .await
        );
        assert!(
            !cache
                .has_permission(&resource, &base, Some("AT1"), DELETE_PROJECT)
                .await
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_drops_all_entries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(authz_app(Arc::clone(&hits), Duration::ZERO)).await;

        let cache = PermissionCache::new(reqwest::Client::new());
        let resource = project("p1");
        cache
            .fetch(std::slice::from_ref(&resource), &base, Some("AT1"))
            .await;
        assert!(cache.snapshot(&resource).await.has_attempted);

        cache.clear().await;
        assert_eq!(cache.snapshot(&resource).await, ResourcePermissions::default());
    }

    #[tokio::test]
    async fn skipped_without_authorization_service() {
        let cache = PermissionCache::new(reqwest::Client::new());
        assert_eq!(
            cache.fetch_if_needed(&project("p1"), "", Some("AT1")).await,
            FetchOutcome::SkippedInFlight
        );
    }
}
