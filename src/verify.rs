//! Network-quality verification for exemption requests.
//!
//! A request registers a waiter for the user and then waits, bounded by
//! the verdict timeout, for the verification page to post the measured
//! speeds. The wait is a oneshot channel; nothing polls.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::monitor::StudyMonitor;

/// Measured connection quality.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkVerdict {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
}

/// Minimum quality a connection must meet to be considered good.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkThresholds {
    pub min_download_mbps: f64,
    pub min_upload_mbps: f64,
    pub max_ping_ms: f64,
}

impl Default for NetworkThresholds {
    fn default() -> Self {
        Self {
            min_download_mbps: 2.5,
            min_upload_mbps: 2.5,
            max_ping_ms: 50.0,
        }
    }
}

impl NetworkThresholds {
    pub fn is_good(&self, verdict: &NetworkVerdict) -> bool {
        verdict.download_mbps >= self.min_download_mbps
            && verdict.upload_mbps >= self.min_upload_mbps
            && verdict.ping_ms <= self.max_ping_ms
    }
}

/// What a verification attempt concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    GoodConnection,
    ExemptionGranted,
    NoVerdict,
}

struct Waiter {
    /// Nonce of the token issued for this request.
    nonce: String,
    tx: oneshot::Sender<NetworkVerdict>,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("nonce", &self.nonce)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Users currently waiting for a verdict.
///
/// Each waiter is bound to the nonce of the token issued with it, so a
/// link from an earlier request cannot answer a later one.
#[derive(Debug, Default)]
pub struct VerdictWaiters {
    pending: DashMap<String, Waiter>,
}

impl VerdictWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `user_id` answered only by the token carrying
    /// `nonce`. Replaces any earlier waiter for the user.
    pub fn register(&self, user_id: &str, nonce: &str) -> PendingVerdict {
        self.pending.retain(|_, waiter| !waiter.tx.is_closed());

        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            nonce: nonce.to_string(),
            tx,
        };
        if self.pending.insert(user_id.to_string(), waiter).is_some() {
            tracing::debug!(user_id = %user_id, "Replaced earlier verification request");
        }
        PendingVerdict {
            user_id: user_id.to_string(),
            rx,
        }
    }

    /// Delivers a verdict from the token carrying `nonce`. Returns `false`
    /// if nobody is waiting or the token belongs to another request.
    pub fn submit(&self, user_id: &str, nonce: &str, verdict: NetworkVerdict) -> bool {
        let Some((_, waiter)) = self.pending.remove_if(user_id, |_, w| w.nonce == nonce) else {
            tracing::debug!(user_id = %user_id, "Verdict with no matching pending request");
            return false;
        };
        waiter.tx.send(verdict).is_ok()
    }

    pub fn is_pending(&self, user_id: &str) -> bool {
        self.pending
            .get(user_id)
            .map(|waiter| !waiter.tx.is_closed())
            .unwrap_or(false)
    }
}

/// Receiving side of one verification request.
#[derive(Debug)]
pub struct PendingVerdict {
    user_id: String,
    rx: oneshot::Receiver<NetworkVerdict>,
}

impl PendingVerdict {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Waits up to `timeout`. A replaced request resolves to `None`.
    pub async fn wait(self, timeout: Duration) -> Option<NetworkVerdict> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(verdict)) => Some(verdict),
            Ok(Err(_)) => {
                tracing::debug!(user_id = %self.user_id, "Verification request superseded");
                None
            }
            Err(_) => None,
        }
    }
}

/// Waits for the verdict and applies it to the monitor.
pub async fn run_verification(monitor: StudyMonitor, pending: PendingVerdict) -> VerificationOutcome {
    let user_id = pending.user_id().to_string();
    let timeout = monitor.config().verdict_timeout;
    tracing::info!(user_id = %user_id, timeout_secs = timeout.as_secs(), "Waiting for network verdict");

    let verdict = pending.wait(timeout).await;
    monitor.resolve_verification(&user_id, verdict)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(download: f64, upload: f64, ping: f64) -> NetworkVerdict {
        NetworkVerdict {
            download_mbps: download,
            upload_mbps: upload,
            ping_ms: ping,
        }
    }

    #[test]
    fn test_thresholds() {
        let t = NetworkThresholds::default();
        assert!(t.is_good(&verdict(2.5, 2.5, 50.0)));
        assert!(!t.is_good(&verdict(2.4, 10.0, 10.0)));
        assert!(!t.is_good(&verdict(10.0, 2.0, 10.0)));
        assert!(!t.is_good(&verdict(10.0, 10.0, 51.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_wakes_waiter() {
        let waiters = VerdictWaiters::new();
        let pending = waiters.register("u1", "n1");
        assert!(waiters.is_pending("u1"));

        let task = tokio::spawn(pending.wait(Duration::from_secs(90)));
        assert!(waiters.submit("u1", "n1", verdict(1.0, 1.0, 200.0)));

        assert_eq!(task.await.unwrap(), Some(verdict(1.0, 1.0, 200.0)));
        assert!(!waiters.is_pending("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let waiters = VerdictWaiters::new();
        let pending = waiters.register("u1", "n1");

        assert_eq!(pending.wait(Duration::from_secs(90)).await, None);
        assert!(!waiters.is_pending("u1"));
        assert!(!waiters.submit("u1", "n1", verdict(1.0, 1.0, 1.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_request_supersedes_old() {
        let waiters = VerdictWaiters::new();
        let first = waiters.register("u1", "n1");
        let second = waiters.register("u1", "n2");

        assert_eq!(first.wait(Duration::from_secs(90)).await, None);

        let task = tokio::spawn(second.wait(Duration::from_secs(90)));
        assert!(!waiters.submit("u1", "n1", verdict(1.0, 1.0, 1.0)));
        assert!(waiters.is_pending("u1"));
        assert!(waiters.submit("u1", "n2", verdict(5.0, 5.0, 5.0)));
        assert_eq!(task.await.unwrap(), Some(verdict(5.0, 5.0, 5.0)));
    }

    #[test]
    fn test_submit_without_request() {
        let waiters = VerdictWaiters::new();
        assert!(!waiters.submit("ghost", "n1", verdict(1.0, 1.0, 1.0)));
    }
}
