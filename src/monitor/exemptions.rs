//! Short-lived exemptions from the camera/screen-share requirement.
//!
//! Grants are a map from user ID to expiry instant. Expiry is checked on
//! read; [`ExemptionRegistry::sweep`] only reclaims memory.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::clock::deadline_after;

/// Default exemption window (10 minutes).
pub const DEFAULT_EXEMPTION_WINDOW: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub struct ExemptionRegistry {
    grants: DashMap<String, Instant>,
    window: Duration,
}

impl ExemptionRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            grants: DashMap::new(),
            window,
        }
    }

    /// Inserts or renews a grant. Returns the new expiry.
    pub fn grant(&self, user_id: &str) -> Instant {
        let expires_at = deadline_after(self.window);
        self.grants.insert(user_id.to_string(), expires_at);
        tracing::info!(
            user_id = %user_id,
            window_secs = self.window.as_secs(),
            "Exemption granted"
        );
        expires_at
    }

    /// True iff a grant exists and has not expired.
    pub fn is_exempt(&self, user_id: &str) -> bool {
        self.grants
            .get(user_id)
            .map(|expires_at| Instant::now() < *expires_at)
            .unwrap_or(false)
    }

    /// Time left on a user's grant, if any.
    pub fn remaining(&self, user_id: &str) -> Option<Duration> {
        let expires_at = *self.grants.get(user_id)?;
        let now = Instant::now();
        (now < expires_at).then(|| expires_at - now)
    }

    /// Drops expired grants. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.grants.len();
        self.grants.retain(|_, expires_at| now < *expires_at);
        let removed = before.saturating_sub(self.grants.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept expired exemptions");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

impl Default for ExemptionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EXEMPTION_WINDOW)
    }
}
