//! Study activity monitoring.
//!
//! Presence changes flow through the [`normalizer`] into the
//! [`orchestrator`], which drives the [`exemptions`] registry, the
//! [`grace`] timers and the session [`ledger`], and queues side effects on
//! the [`dispatch`] worker.

pub mod clock;
pub mod dispatch;
pub mod exemptions;
pub mod grace;
pub mod ledger;
pub mod normalizer;
pub mod notice;
pub mod orchestrator;

pub use clock::{Clock, RuntimeClock};
pub use dispatch::{spawn_worker, DispatchWorker, Dispatcher, Outbound, Platform, StudyStore};
pub use exemptions::ExemptionRegistry;
pub use grace::{GraceTimer, GraceTimers};
pub use ledger::{ClosedSession, OpenSession, SessionLedger};
pub use normalizer::{normalize, PresenceChange, Transition, VoiceSnapshot};
pub use notice::{Notice, UserNotice};
pub use orchestrator::{Outcome, StudyMonitor, TrackedUserView, UserState};

#[cfg(test)]
mod tests;
