//! User directory lookups
//!
//! Accounts live in role-scoped trees: `accounts/police/{uid}`,
//! `accounts/civilian/{uid}`, and a single shared `accounts/admin` record for
//! the dashboard operator.

use crate::store::{RealtimeStore, StoreError};
use crate::types::Role;
use std::sync::Arc;

const POLICE_ACCOUNTS: &str = "accounts/police";
const CIVILIAN_ACCOUNTS: &str = "accounts/civilian";
const ADMIN_ACCOUNT: &str = "accounts/admin";

const ADMIN_FALLBACK_NAME: &str = "Admin Dashboard";
const UNKNOWN_USER_NAME: &str = "Unknown User";

/// Resolves user ids to roles and display names
#[derive(Clone)]
pub struct UserDirectory {
    store: Arc<dyn RealtimeStore>,
}

impl UserDirectory {
    /// Create a directory over the shared store
    #[must_use]
    pub fn new(store: Arc<dyn RealtimeStore>) -> Self {
        Self { store }
    }

    /// Resolve the role of a user by probing role-scoped records
    ///
    /// Checks the officer tree, then the civilian tree. A user found in
    /// neither resolves to `Civilian` (a documented fallback, not an error).
    ///
    /// # Errors
    ///
    /// Returns error when a store read fails.
    pub async fn resolve_role(&self, user_id: &str) -> Result<Role, StoreError> {
        let police = self
            .store
            .get(&format!("{POLICE_ACCOUNTS}/{user_id}"))
            .await?;
        if !police.is_null() {
            return Ok(Role::Police);
        }

        let civilian = self
            .store
            .get(&format!("{CIVILIAN_ACCOUNTS}/{user_id}"))
            .await?;
        if !civilian.is_null() {
            return Ok(Role::Civilian);
        }

        Ok(Role::Civilian)
    }

    /// Resolve the display name of a user
    ///
    /// Always returns a usable name: lookup failures are logged and absorbed
    /// into the role's fallback label.
    pub async fn resolve_name(&self, user_id: &str, role: Role) -> String {
        match self.try_resolve_name(user_id, role).await {
            Ok(name) => name,
            Err(error) => {
                tracing::warn!(user_id, %role, %error, "name lookup failed, using fallback");
                match role {
                    Role::Admin => ADMIN_FALLBACK_NAME.to_string(),
                    _ => UNKNOWN_USER_NAME.to_string(),
                }
            }
        }
    }

    async fn try_resolve_name(&self, user_id: &str, role: Role) -> Result<String, StoreError> {
        if role == Role::Admin {
            // The single shared admin record is matched by secondary identity
            // fields rather than keyed by uid.
            let admin = self.store.get(ADMIN_ACCOUNT).await?;
            let matches = admin
                .get("authUid")
                .and_then(|v| v.as_str())
                .is_some_and(|uid| uid == user_id)
                || admin
                    .get("userId")
                    .and_then(|v| v.as_str())
                    .is_some_and(|uid| uid == user_id);
            if matches {
                let name = admin
                    .get("displayName")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .or_else(|| {
                        admin
                            .get("email")
                            .and_then(|v| v.as_str())
                            .filter(|s| !s.is_empty())
                    })
                    .unwrap_or(ADMIN_FALLBACK_NAME);
                return Ok(name.to_string());
            }
            return Ok(ADMIN_FALLBACK_NAME.to_string());
        }

        let tree = match role {
            Role::Police => POLICE_ACCOUNTS,
            _ => CIVILIAN_ACCOUNTS,
        };
        let account = self.store.get(&format!("{tree}/{user_id}")).await?;

        let first = account.get("firstName").and_then(|v| v.as_str()).unwrap_or("");
        let last = account.get("lastName").and_then(|v| v.as_str()).unwrap_or("");
        let full = format!("{first} {last}").trim().to_string();
        if full.is_empty() {
            Ok(UNKNOWN_USER_NAME.to_string())
        } else {
            Ok(full)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn directory(store: &MemoryStore) -> UserDirectory {
        UserDirectory::new(Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn test_resolve_role_probes_police_first() {
        let store = MemoryStore::new();
        store
            .set("accounts/police/p1", json!({"firstName": "Ria"}))
            .await
            .unwrap();
        store
            .set("accounts/civilian/c1", json!({"firstName": "Ana"}))
            .await
            .unwrap();

        let directory = directory(&store);
        assert_eq!(directory.resolve_role("p1").await.unwrap(), Role::Police);
        assert_eq!(directory.resolve_role("c1").await.unwrap(), Role::Civilian);
    }

    #[tokio::test]
    async fn test_resolve_role_defaults_to_civilian() {
        let store = MemoryStore::new();
        let directory = directory(&store);
        assert_eq!(
            directory.resolve_role("ghost").await.unwrap(),
            Role::Civilian
        );
    }

    #[tokio::test]
    async fn test_resolve_name_concatenates_and_trims() {
        let store = MemoryStore::new();
        store
            .set(
                "accounts/civilian/c1",
                json!({"firstName": "Ana", "lastName": "Cruz"}),
            )
            .await
            .unwrap();
        store
            .set("accounts/police/p1", json!({"firstName": "Ria"}))
            .await
            .unwrap();

        let directory = directory(&store);
        assert_eq!(directory.resolve_name("c1", Role::Civilian).await, "Ana Cruz");
        assert_eq!(directory.resolve_name("p1", Role::Police).await, "Ria");
    }

    #[tokio::test]
    async fn test_resolve_name_unknown_user_fallback() {
        let store = MemoryStore::new();
        let directory = directory(&store);
        assert_eq!(
            directory.resolve_name("ghost", Role::Civilian).await,
            "Unknown User"
        );
    }

    #[tokio::test]
    async fn test_resolve_admin_name_by_secondary_fields() {
        let store = MemoryStore::new();
        store
            .set(
                "accounts/admin",
                json!({"authUid": "a1", "userId": "admin-1", "displayName": "Dispatch HQ"}),
            )
            .await
            .unwrap();

        let directory = directory(&store);
        assert_eq!(directory.resolve_name("a1", Role::Admin).await, "Dispatch HQ");
        assert_eq!(
            directory.resolve_name("admin-1", Role::Admin).await,
            "Dispatch HQ"
        );
        assert_eq!(
            directory.resolve_name("stranger", Role::Admin).await,
            "Admin Dashboard"
        );
    }

    #[tokio::test]
    async fn test_resolve_admin_name_email_fallback() {
        let store = MemoryStore::new();
        store
            .set(
                "accounts/admin",
                json!({"authUid": "a1", "email": "ops@example.org"}),
            )
            .await
            .unwrap();

        let directory = directory(&store);
        assert_eq!(
            directory.resolve_name("a1", Role::Admin).await,
            "ops@example.org"
        );
    }
}
