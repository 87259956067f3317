//! Outbound actions and the worker that executes them.
//!
//! The monitor never waits on the chat platform or the database while it
//! holds a user's lock. It queues an [`Outbound`] action and moves on; the
//! worker spawned by [`spawn_worker`] performs it and logs the result.
//! [`DispatchWorker::finish`] closes the queue at shutdown, even while
//! other tasks still hold a [`Dispatcher`].

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};

use super::ledger::ClosedSession;
use super::notice::{Notice, UserNotice};
use crate::error::{MonitorError, PlatformError, StoreError};
use crate::feed::{self, EventFeed};

/// Attempts made to persist a closed session before giving up.
const PERSIST_ATTEMPTS: u32 = 3;
/// Upper bound for a single platform call.
const PLATFORM_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Chat platform operations the monitor relies on.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn notify_channel(
        &self,
        channel_id: &str,
        notice: &Notice,
        delete_after: Duration,
    ) -> Result<(), PlatformError>;

    async fn notify_user(&self, user_id: &str, notice: &UserNotice) -> Result<(), PlatformError>;

    async fn force_disconnect(&self, server_id: &str, user_id: &str) -> Result<(), PlatformError>;
}

/// Configuration lookup and durable accumulation.
pub trait StudyStore: Send + Sync {
    /// Monitored channel of a server, if configured.
    fn study_channel(&self, server_id: &str) -> Result<Option<String>, StoreError>;

    /// Adds a closed session to the user's totals. Returns `false` if the
    /// session was already recorded.
    fn record_session(&self, session: &ClosedSession) -> Result<bool, StoreError>;
}

/// A side effect queued by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Outbound {
    NotifyChannel {
        channel_id: String,
        notice: Notice,
        #[serde(with = "duration_secs")]
        delete_after: Duration,
    },
    NotifyUser {
        user_id: String,
        notice: UserNotice,
    },
    ForceDisconnect {
        server_id: String,
        user_id: String,
    },
    PersistElapsed(ClosedSession),
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

/// Queue handle used by the monitor.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Dispatcher {
    /// Creates a dispatcher and the receiving end for a worker.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues an action without waiting.
    pub fn send(&self, action: Outbound) {
        if let Err(e) = self.tx.send(action) {
            tracing::warn!(action = ?e.0, "Dispatch worker stopped, dropping action");
        }
    }
}

/// Handle to the running dispatch worker.
#[derive(Debug)]
pub struct DispatchWorker {
    task: JoinHandle<()>,
    stop: oneshot::Sender<()>,
}

impl DispatchWorker {
    /// Closes the queue, runs the actions already in it and waits for the
    /// worker to exit. Actions sent afterwards are dropped with a warning.
    pub async fn finish(self) -> Result<(), JoinError> {
        let _ = self.stop.send(());
        self.task.await
    }
}

/// Spawns the worker that drains `rx` until every [`Dispatcher`] is
/// dropped or [`DispatchWorker::finish`] is called.
///
/// Actions run in arrival order. Failures are logged and, when `events`
/// is set, reported to dashboards.
pub fn spawn_worker(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    platform: Arc<dyn Platform>,
    store: Arc<dyn StudyStore>,
    events: Option<EventFeed>,
) -> DispatchWorker {
    let (stop, mut stop_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        tracing::info!("Dispatch worker started");
        let mut stop_armed = true;
        loop {
            let next = tokio::select! {
                next = rx.recv() => next,
                signal = &mut stop_rx, if stop_armed => {
                    stop_armed = false;
                    // A dropped handle detaches the worker without stopping it
                    if signal.is_ok() {
                        tracing::debug!("Dispatch queue closed, draining");
                        rx.close();
                    }
                    continue;
                }
            };
            let Some(action) = next else { break };
            run_action(&action, platform.as_ref(), &store, events.as_ref()).await;
        }
        tracing::info!("Dispatch worker shutting down");
    });
    DispatchWorker { task, stop }
}

async fn run_action(
    action: &Outbound,
    platform: &dyn Platform,
    store: &Arc<dyn StudyStore>,
    events: Option<&EventFeed>,
) {
    let kind = action_name(action);
    match execute(action, platform, store).await {
        Ok(()) => tracing::debug!(action = kind, "Outbound action completed"),
        Err(e) => tracing::warn!(error = %e, "Outbound action failed"),
    }
    if let Some(events) = events {
        report(events, action);
    }
}

fn action_name(action: &Outbound) -> &'static str {
    match action {
        Outbound::NotifyChannel { .. } => "notify_channel",
        Outbound::NotifyUser { .. } => "notify_user",
        Outbound::ForceDisconnect { .. } => "force_disconnect",
        Outbound::PersistElapsed(_) => "persist_elapsed",
    }
}

async fn execute(
    action: &Outbound,
    platform: &dyn Platform,
    store: &Arc<dyn StudyStore>,
) -> Result<(), MonitorError> {
    let name = action_name(action);
    let result = match action {
        Outbound::NotifyChannel {
            channel_id,
            notice,
            delete_after,
        } => {
            with_timeout(platform.notify_channel(channel_id, notice, *delete_after)).await
        }
        Outbound::NotifyUser { user_id, notice } => {
            with_timeout(platform.notify_user(user_id, notice)).await
        }
        Outbound::ForceDisconnect { server_id, user_id } => {
            let result = with_timeout(platform.force_disconnect(server_id, user_id)).await;
            match &result {
                Ok(()) => tracing::info!(user_id = %user_id, "User disconnected for inactivity"),
                Err(PlatformError::Forbidden(_)) => {
                    tracing::warn!(user_id = %user_id, "Missing permission to move user")
                }
                Err(_) => {}
            }
            result
        }
        Outbound::PersistElapsed(session) => return persist(store, session).await,
    };
    result.map_err(|e| MonitorError::external(name, e))
}

async fn with_timeout<F>(call: F) -> Result<(), PlatformError>
where
    F: std::future::Future<Output = Result<(), PlatformError>>,
{
    tokio::time::timeout(PLATFORM_CALL_TIMEOUT, call)
        .await
        .unwrap_or_else(|_| Err(PlatformError::Transport("timed out".to_string())))
}

/// Records a closed session, retrying on store errors. Retrying is safe
/// because the store deduplicates on the session key.
async fn persist(store: &Arc<dyn StudyStore>, session: &ClosedSession) -> Result<(), MonitorError> {
    let mut last_error = None;
    for attempt in 1..=PERSIST_ATTEMPTS {
        let store = Arc::clone(store);
        let record = session.clone();
        let result = tokio::task::spawn_blocking(move || store.record_session(&record)).await;

        match result {
            Ok(Ok(true)) => {
                tracing::info!(
                    user_id = %session.user_id,
                    server_id = %session.server_id,
                    elapsed_secs = session.elapsed_secs,
                    "Study time recorded"
                );
                return Ok(());
            }
            Ok(Ok(false)) => {
                tracing::debug!(
                    session_key = %session.session_key,
                    "Session already recorded, skipping"
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                tracing::warn!(attempt, error = %e, "Failed to record session");
                last_error = Some(e.to_string());
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "Persist task panicked");
                last_error = Some(e.to_string());
            }
        }
        tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
    }

    tracing::error!(
        user_id = %session.user_id,
        elapsed_secs = session.elapsed_secs,
        "Giving up on recording session"
    );
    Err(MonitorError::external(
        "persist_elapsed",
        last_error.unwrap_or_default(),
    ))
}

fn report(events: &EventFeed, action: &Outbound) {
    match action {
        Outbound::PersistElapsed(session) => {
            feed::publish(events, "session_ended", session);
        }
        Outbound::ForceDisconnect { server_id, user_id } => {
            feed::publish(
                events,
                "user_removed",
                &serde_json::json!({ "server_id": server_id, "user_id": user_id }),
            );
        }
        _ => {}
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording fakes shared by the monitor tests.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct MemoryStore {
        pub channels: Mutex<HashMap<String, String>>,
        pub recorded: Mutex<Vec<ClosedSession>>,
        pub seen: Mutex<HashSet<String>>,
        pub failures_left: Mutex<u32>,
    }

    impl MemoryStore {
        pub fn with_channel(server_id: &str, channel_id: &str) -> Self {
            let store = Self::default();
            store
                .channels
                .lock()
                .unwrap()
                .insert(server_id.to_string(), channel_id.to_string());
            store
        }
    }

    impl StudyStore for MemoryStore {
        fn study_channel(&self, server_id: &str) -> Result<Option<String>, StoreError> {
            Ok(self.channels.lock().unwrap().get(server_id).cloned())
        }

        fn record_session(&self, session: &ClosedSession) -> Result<bool, StoreError> {
            {
                let mut failures = self.failures_left.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(StoreError::Poisoned);
                }
            }
            if !self.seen.lock().unwrap().insert(session.session_key.clone()) {
                return Ok(false);
            }
            self.recorded.lock().unwrap().push(session.clone());
            Ok(true)
        }
    }

    #[derive(Debug, Default)]
    pub struct RecordingPlatform {
        pub calls: Mutex<Vec<String>>,
        pub deny_moves: bool,
    }

    #[async_trait]
    impl Platform for RecordingPlatform {
        async fn notify_channel(
            &self,
            channel_id: &str,
            notice: &Notice,
            _delete_after: Duration,
        ) -> Result<(), PlatformError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("notify {} {}", channel_id, notice.user_id()));
            Ok(())
        }

        async fn notify_user(
            &self,
            user_id: &str,
            _notice: &UserNotice,
        ) -> Result<(), PlatformError> {
            self.calls.lock().unwrap().push(format!("dm {}", user_id));
            Ok(())
        }

        async fn force_disconnect(
            &self,
            _server_id: &str,
            user_id: &str,
        ) -> Result<(), PlatformError> {
            self.calls.lock().unwrap().push(format!("move {}", user_id));
            if self.deny_moves {
                Err(PlatformError::Forbidden("move_members".to_string()))
            } else {
                Ok(())
            }
        }
    }
}
