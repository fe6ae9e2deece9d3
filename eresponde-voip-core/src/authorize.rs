//! Call authorization
//!
//! Police and civilians may only call each other when a dispatch relationship
//! exists: a crime report where one of them is the reporter and the other the
//! assigned officer. Every other role pairing is allowed unconditionally.

use crate::directory::UserDirectory;
use crate::store::{RealtimeStore, StoreError};
use crate::types::Role;
use std::sync::Arc;

const REPORTS: &str = "reports";

const NO_RELATIONSHIP_REASON: &str = "no dispatch relationship";
const CHECK_FAILED_REASON: &str = "unable to verify call permissions";

/// Outcome of an authorization check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPermission {
    /// Whether the call may proceed
    pub allowed: bool,
    /// Why it may not, when denied
    pub reason: Option<String>,
}

impl CallPermission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn denied(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Decides whether a caller may call a callee
#[derive(Clone)]
pub struct AuthorizationGate {
    store: Arc<dyn RealtimeStore>,
    directory: UserDirectory,
}

impl AuthorizationGate {
    /// Create a gate over the shared store
    #[must_use]
    pub fn new(store: Arc<dyn RealtimeStore>) -> Self {
        let directory = UserDirectory::new(Arc::clone(&store));
        Self { store, directory }
    }

    /// Check whether `caller_id` may call `callee_id`
    ///
    /// Never propagates store errors: a failed check denies with a populated
    /// reason, since allowing on error would bypass the gate.
    pub async fn can_call(&self, caller_id: &str, callee_id: &str) -> CallPermission {
        let roles = tokio::try_join!(
            self.directory.resolve_role(caller_id),
            self.directory.resolve_role(callee_id),
        );
        let (caller_role, callee_role) = match roles {
            Ok(roles) => roles,
            Err(error) => {
                tracing::warn!(caller_id, callee_id, %error, "role resolution failed");
                return CallPermission::denied(CHECK_FAILED_REASON);
            }
        };

        let cross_dispatch_pair = matches!(
            (caller_role, callee_role),
            (Role::Police, Role::Civilian) | (Role::Civilian, Role::Police)
        );
        if !cross_dispatch_pair {
            return CallPermission::allowed();
        }

        match self.has_dispatch_relationship(caller_id, callee_id).await {
            Ok(true) => CallPermission::allowed(),
            Ok(false) => CallPermission::denied(NO_RELATIONSHIP_REASON),
            Err(error) => {
                tracing::warn!(caller_id, callee_id, %error, "relationship check failed");
                CallPermission::denied(CHECK_FAILED_REASON)
            }
        }
    }

    /// Whether a report links the two users as reporter and assigned officer,
    /// in either order
    ///
    /// This is a full scan over all report records, acceptable at the
    /// system's expected scale.
    ///
    /// # Errors
    ///
    /// Returns error when the report collection cannot be read.
    pub async fn has_dispatch_relationship(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<bool, StoreError> {
        let reports = self.store.get(REPORTS).await?;
        let Some(reports) = reports.as_object() else {
            return Ok(false);
        };

        for report in reports.values() {
            let reporter = report.get("reporterUid").and_then(|v| v.as_str());
            let officer = report.get("assignedOfficerId").and_then(|v| v.as_str());
            let (Some(reporter), Some(officer)) = (reporter, officer) else {
                continue;
            };
            if (reporter == user_a && officer == user_b)
                || (reporter == user_b && officer == user_a)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn seed_users(store: &MemoryStore) {
        store
            .set("accounts/civilian/civ-a", json!({"firstName": "Ana"}))
            .await
            .unwrap();
        store
            .set("accounts/civilian/civ-b", json!({"firstName": "Ben"}))
            .await
            .unwrap();
        store
            .set("accounts/police/pol-b", json!({"firstName": "Ria"}))
            .await
            .unwrap();
        store
            .set("accounts/police/pol-d", json!({"firstName": "Dan"}))
            .await
            .unwrap();
    }

    fn gate(store: &MemoryStore) -> AuthorizationGate {
        AuthorizationGate::new(Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn test_dispatched_pair_allowed_both_directions() {
        let store = MemoryStore::new();
        seed_users(&store).await;
        store
            .set(
                "reports/r1",
                json!({"reporterUid": "civ-a", "assignedOfficerId": "pol-b"}),
            )
            .await
            .unwrap();

        let gate = gate(&store);
        assert!(gate.can_call("civ-a", "pol-b").await.allowed);
        assert!(gate.can_call("pol-b", "civ-a").await.allowed);
    }

    #[tokio::test]
    async fn test_unrelated_police_civilian_denied_with_reason() {
        let store = MemoryStore::new();
        seed_users(&store).await;
        store
            .set(
                "reports/r1",
                json!({"reporterUid": "civ-a", "assignedOfficerId": "pol-b"}),
            )
            .await
            .unwrap();

        let gate = gate(&store);
        let permission = gate.can_call("civ-a", "pol-d").await;
        assert!(!permission.allowed);
        assert_eq!(permission.reason.as_deref(), Some("no dispatch relationship"));
    }

    #[tokio::test]
    async fn test_same_role_pairs_allowed_unconditionally() {
        let store = MemoryStore::new();
        seed_users(&store).await;

        let gate = gate(&store);
        assert!(gate.can_call("civ-a", "civ-b").await.allowed);
        assert!(gate.can_call("pol-b", "pol-d").await.allowed);
    }

    #[tokio::test]
    async fn test_relationship_scan_skips_incomplete_reports() {
        let store = MemoryStore::new();
        seed_users(&store).await;
        store
            .set("reports/r0", json!({"reporterUid": "civ-a"}))
            .await
            .unwrap();
        store
            .set(
                "reports/r1",
                json!({"reporterUid": "civ-a", "assignedOfficerId": "pol-b"}),
            )
            .await
            .unwrap();

        let gate = gate(&store);
        assert!(gate
            .has_dispatch_relationship("pol-b", "civ-a")
            .await
            .unwrap());
        assert!(!gate
            .has_dispatch_relationship("civ-a", "pol-d")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_no_reports_means_no_relationship() {
        let store = MemoryStore::new();
        seed_users(&store).await;

        let gate = gate(&store);
        let permission = gate.can_call("civ-a", "pol-b").await;
        assert!(!permission.allowed);
        assert!(permission.reason.is_some());
    }
}
