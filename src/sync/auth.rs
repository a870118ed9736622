use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumIter, EnumString};
use tokio::sync::RwLock;
use tracing::info;

/// Roles issued by the church management API
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Role {
    SuperAdmin,
    Admin,
    Pastor,
    Missionary,
    Member,
    Interested,
}

#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub is_authenticated: bool,
    pub user_id: Option<i64>,
    pub role: Option<Role>,
}

/// Tracks the signed-in user whose role gates offline caching
pub struct SessionManager {
    state: Arc<RwLock<AuthState>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(AuthState::default())),
        }
    }

    pub async fn login(&self, user_id: i64, role: Role) {
        let mut state = self.state.write().await;
        state.is_authenticated = true;
        state.user_id = Some(user_id);
        state.role = Some(role);
        info!("Session started for user {} ({})", user_id, role);
    }

    pub async fn logout(&self) {
        let mut state = self.state.write().await;
        if let Some(user_id) = state.user_id {
            info!("Session ended for user {}", user_id);
        }
        *state = AuthState::default();
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.is_authenticated
    }

    pub async fn user_id(&self) -> Option<i64> {
        self.state.read().await.user_id
    }

    pub async fn role(&self) -> Option<Role> {
        self.state.read().await.role
    }

    /// Get current auth state
    pub async fn get_state(&self) -> AuthState {
        self.state.read().await.clone()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names_match_api() {
        assert_eq!(Role::SuperAdmin.to_string(), "superadmin");
        assert_eq!("Pastor".parse::<Role>().unwrap(), Role::Pastor);
        assert_eq!(
            serde_json::to_string(&Role::Missionary).unwrap(),
            "\"missionary\""
        );
    }

    #[tokio::test]
    async fn test_login_logout() {
        let session = SessionManager::new();
        assert!(!session.is_authenticated().await);

        session.login(4425, Role::Admin).await;
        assert_eq!(session.user_id().await, Some(4425));
        assert_eq!(session.role().await, Some(Role::Admin));

        session.logout().await;
        let state = session.get_state().await;
        assert!(!state.is_authenticated);
        assert!(state.role.is_none());
    }
}
