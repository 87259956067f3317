//! The study monitor state machine.
//!
//! Every tracked user owns a slot guarded by its own async mutex. All
//! work for one user (session start/stop, timer start/cancel, state
//! change) happens under that lock, and nothing inside the lock waits on
//! I/O: side effects are queued on the [`Dispatcher`].
//!
//! ```text
//! Absent --Joined--> PresentUnsatisfied | PresentExempt | PresentSatisfied
//! PresentUnsatisfied --ActivityEnabled--> PresentSatisfied
//! PresentSatisfied --ActivityDisabled--> PresentUnsatisfied | PresentExempt
//! Present* --Left--> Absent
//! PresentUnsatisfied --grace timer--> Absent (forced removal)
//! ```

use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::clock::Clock;
use super::dispatch::{Dispatcher, Outbound, StudyStore};
use super::exemptions::ExemptionRegistry;
use super::grace::{GraceTimer, GraceTimers};
use super::ledger::{ClosedSession, SessionLedger};
use super::normalizer::{normalize, PresenceChange, Transition};
use super::notice::{Notice, UserNotice};
use crate::config::{DisableAccounting, MonitorConfig};
use crate::error::MonitorError;
use crate::verify::{NetworkVerdict, VerificationOutcome};

/// Per-user monitoring state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    Absent,
    PresentSatisfied,
    /// Grace timer running.
    PresentUnsatisfied,
    /// Unsatisfied but exempt, no timer.
    PresentExempt,
}

/// Result of feeding one presence change to the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Not relevant to any monitored channel or user.
    Ignored,
    /// Replayed event; state already reflects it.
    Duplicate { state: UserState },
    Applied { from: UserState, to: UserState },
}

/// Read-only view of a tracked user.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedUserView {
    pub user_id: String,
    pub server_id: String,
    pub channel_id: String,
    pub display_name: String,
    pub state: UserState,
    pub session_started_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Seconds until the grace timer fires, if one is running.
    pub grace_remaining_secs: Option<u64>,
    pub exempt: bool,
}

#[derive(Debug)]
struct TrackedUser {
    user_id: String,
    server_id: String,
    channel_id: String,
    display_name: String,
    state: UserState,
    activity_satisfied: bool,
    timer: Option<GraceTimer>,
}

impl TrackedUser {
    fn absent(change: &PresenceChange) -> Self {
        Self {
            user_id: change.user_id.clone(),
            server_id: change.server_id.clone(),
            channel_id: String::new(),
            display_name: change.display_name.clone(),
            state: UserState::Absent,
            activity_satisfied: false,
            timer: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.state == UserState::Absent && self.timer.is_none()
    }
}

type Slot = Arc<Mutex<TrackedUser>>;

struct Inner {
    config: MonitorConfig,
    store: Arc<dyn StudyStore>,
    exemptions: ExemptionRegistry,
    ledger: SessionLedger,
    timers: GraceTimers,
    users: DashMap<String, Slot>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
}

/// Cheaply cloneable handle to the monitor.
#[derive(Clone)]
pub struct StudyMonitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StudyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StudyMonitor")
            .field("tracked_users", &self.inner.users.len())
            .field("open_sessions", &self.inner.ledger.open_count())
            .finish()
    }
}

impl StudyMonitor {
    pub fn new(
        config: MonitorConfig,
        store: Arc<dyn StudyStore>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let inner = Inner {
            exemptions: ExemptionRegistry::new(config.exemption_window),
            timers: GraceTimers::new(config.grace_period),
            ledger: SessionLedger::new(),
            users: DashMap::new(),
            config,
            store,
            dispatcher,
            clock,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn exemptions(&self) -> &ExemptionRegistry {
        &self.inner.exemptions
    }

    pub fn ledger(&self) -> &SessionLedger {
        &self.inner.ledger
    }

    /// Feeds one presence change through normalization and the state machine.
    pub async fn handle(&self, change: &PresenceChange) -> Result<Outcome, MonitorError> {
        if change.is_bot {
            tracing::trace!(user_id = %change.user_id, "Bot presence change ignored");
            return Ok(Outcome::Ignored);
        }

        let monitored = self.inner.store.study_channel(&change.server_id)?;
        if monitored.is_none() {
            tracing::debug!(
                error = %MonitorError::ConfigMissing { server_id: change.server_id.clone() },
                "Presence change ignored"
            );
        }

        let transition = normalize(change, monitored.as_deref());
        Ok(self.inner.apply(change, transition).await)
    }

    /// Current state of a user (`Absent` if untracked).
    pub async fn state_of(&self, user_id: &str) -> UserState {
        let Some(slot) = self.inner.slot(user_id) else {
            return UserState::Absent;
        };
        let state = slot.lock().await.state;
        state
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.users.len()
    }

    /// Snapshot of every tracked user.
    pub async fn snapshot(&self) -> Vec<TrackedUserView> {
        let slots: Vec<Slot> = self
            .inner
            .users
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let now = tokio::time::Instant::now();
        let mut views = Vec::with_capacity(slots.len());
        for slot in slots {
            let user = slot.lock().await;
            views.push(TrackedUserView {
                user_id: user.user_id.clone(),
                server_id: user.server_id.clone(),
                channel_id: user.channel_id.clone(),
                display_name: user.display_name.clone(),
                state: user.state,
                session_started_at: self.inner.ledger.get(&user.user_id).map(|s| s.started_at),
                grace_remaining_secs: user
                    .timer
                    .as_ref()
                    .map(|t| t.deadline().saturating_duration_since(now).as_secs()),
                exempt: self.inner.exemptions.is_exempt(&user.user_id),
            });
        }
        views.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        views
    }

    /// Applies a network-quality verdict (or its absence) for a user and
    /// tells them the result.
    pub fn resolve_verification(
        &self,
        user_id: &str,
        verdict: Option<NetworkVerdict>,
    ) -> VerificationOutcome {
        let inner = &self.inner;
        let outcome = match verdict {
            None => {
                tracing::warn!(
                    error = %MonitorError::TimeoutNoVerdict { user_id: user_id.to_string() },
                    "Exemption denied"
                );
                VerificationOutcome::NoVerdict
            }
            Some(verdict) if inner.config.thresholds.is_good(&verdict) => {
                tracing::info!(user_id = %user_id, ?verdict, "Connection is good, no exemption");
                VerificationOutcome::GoodConnection
            }
            Some(verdict) => {
                tracing::info!(user_id = %user_id, ?verdict, "Poor connection verified");
                inner.exemptions.grant(user_id);
                VerificationOutcome::ExemptionGranted
            }
        };

        let notice = match outcome {
            VerificationOutcome::GoodConnection => UserNotice::GoodConnection,
            VerificationOutcome::ExemptionGranted => UserNotice::ExemptionGranted {
                minutes: inner.config.exemption_window.as_secs() / 60,
            },
            VerificationOutcome::NoVerdict => UserNotice::NoVerdict,
        };
        inner.dispatcher.send(Outbound::NotifyUser {
            user_id: user_id.to_string(),
            notice,
        });
        outcome
    }

    /// Periodically drops expired exemptions. Stops once the monitor is gone.
    pub fn spawn_exemption_sweeper(&self) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.exemption_sweep_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.exemptions.sweep();
            }
        })
    }

    /// Ends every open session and cancels every timer.
    ///
    /// Returns the sessions that were queued for persistence.
    pub async fn shutdown(&self) -> Vec<ClosedSession> {
        let slots: Vec<(String, Slot)> = self
            .inner
            .users
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut closed = Vec::new();
        for (user_id, slot) in slots {
            {
                let mut user = slot.lock().await;
                GraceTimers::cancel(&mut user.timer);
                if user.state != UserState::Absent {
                    if let Some(session) = self.inner.close_session(&user) {
                        closed.push(session);
                    }
                    user.state = UserState::Absent;
                }
            }
            drop(slot);
            self.inner.release_if_idle(&user_id);
        }
        tracing::info!(sessions = closed.len(), "Monitor shut down");
        closed
    }
}

#[cfg(test)]
impl StudyMonitor {
    pub(crate) async fn current_timer_id(&self, user_id: &str) -> Option<u64> {
        let slot = self.inner.slot(user_id)?;
        let id = slot.lock().await.timer.as_ref().map(GraceTimer::id);
        id
    }

    /// Runs the fire handler directly, as a timer racing a transition would.
    pub(crate) async fn fire_grace_timer(&self, user_id: &str, timer_id: u64) {
        self.inner.on_grace_expired(user_id, timer_id).await;
    }
}

impl Inner {
    fn slot(&self, user_id: &str) -> Option<Slot> {
        self.users.get(user_id).map(|entry| Arc::clone(entry.value()))
    }

    async fn apply(self: &Arc<Self>, change: &PresenceChange, transition: Transition) -> Outcome {
        let slot = match &transition {
            Transition::Ignore => return Outcome::Ignored,
            Transition::Joined { .. } => Arc::clone(
                self.users
                    .entry(change.user_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(TrackedUser::absent(change))))
                    .value(),
            ),
            _ => match self.slot(&change.user_id) {
                Some(slot) => slot,
                None => {
                    tracing::debug!(
                        user_id = %change.user_id,
                        ?transition,
                        "Presence change for untracked user ignored"
                    );
                    return Outcome::Ignored;
                }
            },
        };

        let outcome = {
            let mut user = slot.lock().await;
            self.step(&mut user, change, transition)
        };
        drop(slot);
        self.release_if_idle(&change.user_id);

        if let Outcome::Duplicate { state } = &outcome {
            tracing::debug!(user_id = %change.user_id, ?state, "Duplicate presence change absorbed");
        }
        outcome
    }

    /// Runs one transition with the user's lock held.
    fn step(
        self: &Arc<Self>,
        user: &mut TrackedUser,
        change: &PresenceChange,
        transition: Transition,
    ) -> Outcome {
        let from = user.state;
        if !change.display_name.is_empty() {
            user.display_name = change.display_name.clone();
        }
        user.activity_satisfied = change.after.is_active();

        let to = match transition {
            Transition::Ignore => return Outcome::Ignored,

            Transition::Joined { channel_id, .. } => {
                if from != UserState::Absent {
                    return Outcome::Duplicate { state: from };
                }
                user.server_id = change.server_id.clone();
                user.channel_id = channel_id;
                self.ledger.start(
                    &user.user_id,
                    &user.server_id,
                    &user.display_name,
                    self.clock.now(),
                );

                let to = if user.activity_satisfied {
                    UserState::PresentSatisfied
                } else if self.exemptions.is_exempt(&user.user_id) {
                    UserState::PresentExempt
                } else {
                    self.start_grace(user);
                    UserState::PresentUnsatisfied
                };
                self.notify(
                    user,
                    Notice::Welcome {
                        user_id: user.user_id.clone(),
                        display_name: user.display_name.clone(),
                        activity_required: to == UserState::PresentUnsatisfied,
                        grace_minutes: self.grace_minutes(),
                    },
                    self.config.notice_delete_after,
                );
                to
            }

            Transition::Left { .. } => {
                if from == UserState::Absent {
                    return Outcome::Duplicate { state: from };
                }
                GraceTimers::cancel(&mut user.timer);
                self.close_session(user);
                self.notify(
                    user,
                    Notice::Departure {
                        user_id: user.user_id.clone(),
                        display_name: user.display_name.clone(),
                    },
                    self.config.notice_delete_after,
                );
                self.notify(
                    user,
                    Notice::BreakHint {
                        user_id: user.user_id.clone(),
                    },
                    self.config.departure_delete_after,
                );
                UserState::Absent
            }

            Transition::ActivityEnabled { .. } => match from {
                UserState::PresentUnsatisfied | UserState::PresentExempt => {
                    GraceTimers::cancel(&mut user.timer);
                    self.notify(
                        user,
                        Notice::ActivityConfirmed {
                            user_id: user.user_id.clone(),
                        },
                        self.config.notice_delete_after,
                    );
                    UserState::PresentSatisfied
                }
                UserState::PresentSatisfied => return Outcome::Duplicate { state: from },
                UserState::Absent => return Outcome::Ignored,
            },

            Transition::ActivityDisabled { .. } => match from {
                UserState::PresentSatisfied => {
                    self.restart_accounting(user);
                    if self.exemptions.is_exempt(&user.user_id) {
                        tracing::info!(user_id = %user.user_id, "Activity off, warning suppressed by exemption");
                        UserState::PresentExempt
                    } else {
                        self.start_grace(user);
                        self.notify(
                            user,
                            Notice::ActivityWarning {
                                user_id: user.user_id.clone(),
                                grace_minutes: self.grace_minutes(),
                            },
                            self.config.notice_delete_after,
                        );
                        UserState::PresentUnsatisfied
                    }
                }
                UserState::PresentUnsatisfied | UserState::PresentExempt => {
                    return Outcome::Duplicate { state: from }
                }
                UserState::Absent => return Outcome::Ignored,
            },
        };

        user.state = to;
        tracing::info!(
            user_id = %user.user_id,
            server_id = %user.server_id,
            ?from,
            ?to,
            "Study state changed"
        );
        Outcome::Applied { from, to }
    }

    fn restart_accounting(&self, user: &TrackedUser) {
        match self.config.disable_accounting {
            DisableAccounting::Discard => {
                self.ledger.cancel(&user.user_id);
            }
            DisableAccounting::Persist => {
                self.close_session(user);
            }
        }
        self.ledger.start(
            &user.user_id,
            &user.server_id,
            &user.display_name,
            self.clock.now(),
        );
    }

    /// Ends the user's session and queues it for persistence.
    fn close_session(&self, user: &TrackedUser) -> Option<ClosedSession> {
        let closed = self.ledger.end(
            &user.user_id,
            &user.server_id,
            &user.display_name,
            self.clock.now(),
        )?;
        self.dispatcher.send(Outbound::PersistElapsed(closed.clone()));
        Some(closed)
    }

    fn grace_minutes(&self) -> u64 {
        self.timers.period().as_secs().div_ceil(60)
    }

    fn notify(&self, user: &TrackedUser, notice: Notice, delete_after: Duration) {
        self.dispatcher.send(Outbound::NotifyChannel {
            channel_id: user.channel_id.clone(),
            notice,
            delete_after,
        });
    }

    fn start_grace(self: &Arc<Self>, user: &mut TrackedUser) {
        let weak = Arc::downgrade(self);
        let user_id = user.user_id.clone();
        let timer_id = self
            .timers
            .start(&mut user.timer, &user.channel_id, move |timer_id| async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_grace_expired(&user_id, timer_id).await;
                }
            });
        tracing::info!(
            user_id = %user.user_id,
            timer_id,
            grace_secs = self.timers.period().as_secs(),
            "Grace timer started"
        );
    }

    /// Fire handler. Re-validates against the state at fire time.
    async fn on_grace_expired(self: &Arc<Self>, user_id: &str, timer_id: u64) {
        let Some(slot) = self.slot(user_id) else {
            tracing::debug!(user_id = %user_id, timer_id, "Grace timer fired for untracked user");
            return;
        };

        {
            let mut user = slot.lock().await;
            if user.timer.as_ref().map(GraceTimer::id) != Some(timer_id) {
                tracing::debug!(user_id = %user_id, timer_id, "Stale grace timer ignored");
                return;
            }
            user.timer = None;

            if user.state != UserState::PresentUnsatisfied || user.activity_satisfied {
                tracing::debug!(user_id = %user_id, state = ?user.state, "Grace timer no longer applies");
            } else if self.exemptions.is_exempt(user_id) {
                tracing::info!(user_id = %user_id, "Grace timer expired but user is exempt");
                user.state = UserState::PresentExempt;
            } else {
                self.force_remove(&mut user);
            }
        }

        drop(slot);
        self.release_if_idle(user_id);
    }

    fn force_remove(&self, user: &mut TrackedUser) {
        tracing::info!(
            user_id = %user.user_id,
            server_id = %user.server_id,
            "No camera or screen share within grace period, removing user"
        );
        self.notify(
            user,
            Notice::Inactivity {
                user_id: user.user_id.clone(),
            },
            self.config.notice_delete_after,
        );
        self.dispatcher.send(Outbound::ForceDisconnect {
            server_id: user.server_id.clone(),
            user_id: user.user_id.clone(),
        });
        self.ledger.cancel(&user.user_id);
        user.state = UserState::Absent;
    }

    /// Drops an idle slot unless another task holds a reference to it.
    fn release_if_idle(&self, user_id: &str) {
        self.users.remove_if(user_id, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot
                    .try_lock()
                    .map(|user| user.is_idle())
                    .unwrap_or(false)
        });
    }
}
