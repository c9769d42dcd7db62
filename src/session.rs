use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct LinkOwner {
    user_id: String,
    expires_at: Option<DateTime<Utc>>,
}

impl LinkOwner {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// In-memory identity hints for requests that arrive without a bearer token.
///
/// The link map is keyed by the Plaid link token, so a webhook-driven
/// exchange can be attributed to whoever opened that link session. The
/// single "current user" slot is last-write-wins across all users and is only
/// consulted after the link map comes up empty. Link entries are dropped once
/// exchanged or past the link token's expiration.
#[derive(Clone, Default)]
pub struct BearerCache {
    current: Arc<RwLock<Option<String>>>,
    link_owners: Arc<RwLock<HashMap<String, LinkOwner>>>,
}

impl BearerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_current_user(&self, token: &str) {
        *self.current.write().await = Some(token.to_string());
    }

    pub async fn current_user(&self) -> Option<String> {
        self.current.read().await.clone()
    }

    pub async fn remember_link(
        &self,
        link_token: &str,
        user_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) {
        let now = Utc::now();
        let mut link_owners = self.link_owners.write().await;
        link_owners.retain(|_, owner| owner.is_live(now));
        link_owners.insert(
            link_token.to_string(),
            LinkOwner {
                user_id: user_id.to_string(),
                expires_at,
            },
        );
    }

    pub async fn link_owner(&self, link_token: &str) -> Option<String> {
        self.link_owners
            .read()
            .await
            .get(link_token)
            .filter(|owner| owner.is_live(Utc::now()))
            .map(|owner| owner.user_id.clone())
    }

    pub async fn forget_link(&self, link_token: &str) {
        self.link_owners.write().await.remove(link_token);
    }

    #[cfg(test)]
    pub async fn link_count(&self) -> usize {
        self.link_owners.read().await.len()
    }
}
