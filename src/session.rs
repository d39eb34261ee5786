//! The single owner of the login token and role.
//!
//! Every component that needs credentials receives a cloned [`Session`]; they
//! all share one slot. When a store is attached the login survives restarts.

use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::api::GradingApi;
use crate::db::{self, Pool};
use crate::model::{Role, User};

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user: User,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default)]
pub struct Session {
    current: Arc<RwLock<Option<Credentials>>>,
    store: Option<Pool>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// A session that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_credentials(token: impl Into<String>, user: User) -> Self {
        Self {
            current: Arc::new(RwLock::new(Some(Credentials {
                token: token.into(),
                user,
            }))),
            store: None,
        }
    }

    /// Load the persisted login, if any, and keep the pool for later writes.
    pub async fn restore(pool: Pool) -> Result<Self> {
        let stored = db::load_session(&pool)
            .await
            .context("failed to load stored session")?;
        let current = stored.map(|s| Credentials {
            token: s.token,
            user: s.user,
        });
        Ok(Self {
            current: Arc::new(RwLock::new(current)),
            store: Some(pool),
        })
    }

    pub async fn login(&self, api: &dyn GradingApi, email: &str, password: &str) -> Result<User> {
        let resp = api.login(email, password).await.context("login failed")?;
        if let Some(pool) = &self.store {
            db::save_session(pool, &resp.token, &resp.user)
                .await
                .context("failed to persist session")?;
        }
        info!(user_id = resp.user.id, role = resp.user.role.as_str(), "logged in");
        let user = resp.user.clone();
        *self.current.write().await = Some(Credentials {
            token: resp.token,
            user: resp.user,
        });
        Ok(user)
    }

    /// Tell the backend (when given) and drop the local credentials.
    /// The local state is cleared even if the remote call fails.
    pub async fn logout(&self, api: Option<&dyn GradingApi>) -> Result<()> {
        if let Some(api) = api {
            if self.token().await.is_some() {
                if let Err(err) = api.logout().await {
                    warn!(?err, "remote logout failed");
                }
            }
        }
        self.clear().await
    }

    /// Forced logout after the backend rejected the token.
    pub async fn expire(&self) {
        if self.current.read().await.is_none() {
            return;
        }
        warn!("session expired; credentials cleared");
        if let Err(err) = self.clear().await {
            warn!(?err, "failed to clear stored session");
        }
    }

    async fn clear(&self) -> Result<()> {
        *self.current.write().await = None;
        if let Some(pool) = &self.store {
            db::clear_session(pool).await?;
        }
        Ok(())
    }

    pub async fn token(&self) -> Option<String> {
        self.current.read().await.as_ref().map(|c| c.token.clone())
    }

    pub async fn user(&self) -> Option<User> {
        self.current.read().await.as_ref().map(|c| c.user.clone())
    }

    pub async fn role(&self) -> Option<Role> {
        self.current.read().await.as_ref().map(|c| c.user.role)
    }

    pub async fn is_admin(&self) -> bool {
        self.role().await == Some(Role::Admin)
    }
}
