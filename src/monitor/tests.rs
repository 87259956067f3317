use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::advance;

use super::dispatch::testing::MemoryStore;
use super::*;
use crate::config::{DisableAccounting, MonitorConfig};
use crate::verify::{NetworkVerdict, VerificationOutcome};

const SERVER: &str = "guild-1";
const STUDY: &str = "study-vc";

struct Harness {
    monitor: StudyMonitor,
    rx: UnboundedReceiver<Outbound>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(MonitorConfig::default())
    }

    fn with_config(config: MonitorConfig) -> Self {
        let store = Arc::new(MemoryStore::with_channel(SERVER, STUDY));
        let (dispatcher, rx) = Dispatcher::channel();
        let monitor = StudyMonitor::new(config, store, dispatcher, Arc::new(RuntimeClock::new()));
        Self { monitor, rx }
    }

    async fn send(&self, change: PresenceChange) -> Outcome {
        self.monitor.handle(&change).await.unwrap()
    }

    fn drain(&mut self) -> Vec<Outbound> {
        let mut actions = Vec::new();
        while let Ok(action) = self.rx.try_recv() {
            actions.push(action);
        }
        actions
    }
}

fn persisted(actions: &[Outbound]) -> Vec<u64> {
    actions
        .iter()
        .filter_map(|a| match a {
            Outbound::PersistElapsed(s) => Some(s.elapsed_secs),
            _ => None,
        })
        .collect()
}

fn removals(actions: &[Outbound]) -> usize {
    actions
        .iter()
        .filter(|a| matches!(a, Outbound::ForceDisconnect { .. }))
        .count()
}

fn notices(actions: &[Outbound]) -> Vec<&Notice> {
    actions
        .iter()
        .filter_map(|a| match a {
            Outbound::NotifyChannel { notice, .. } => Some(notice),
            _ => None,
        })
        .collect()
}

fn change(user: &str, before: VoiceSnapshot, after: VoiceSnapshot) -> PresenceChange {
    PresenceChange {
        user_id: user.to_string(),
        server_id: SERVER.to_string(),
        display_name: format!("{}-name", user),
        is_bot: false,
        before,
        after,
    }
}

fn join(user: &str) -> PresenceChange {
    change(user, VoiceSnapshot::default(), VoiceSnapshot::in_channel(STUDY))
}

fn join_with_camera(user: &str) -> PresenceChange {
    change(
        user,
        VoiceSnapshot::default(),
        VoiceSnapshot::in_channel(STUDY).with_video(true),
    )
}

fn leave(user: &str) -> PresenceChange {
    change(user, VoiceSnapshot::in_channel(STUDY), VoiceSnapshot::default())
}

fn enable(user: &str) -> PresenceChange {
    change(
        user,
        VoiceSnapshot::in_channel(STUDY),
        VoiceSnapshot::in_channel(STUDY).with_stream(true),
    )
}

fn disable(user: &str) -> PresenceChange {
    change(
        user,
        VoiceSnapshot::in_channel(STUDY).with_video(true),
        VoiceSnapshot::in_channel(STUDY),
    )
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

async fn elapse(secs: u64) {
    advance(Duration::from_secs(secs)).await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_screenshare_within_grace_then_leave() {
    let mut h = Harness::new();

    assert_eq!(
        h.send(join("a")).await,
        Outcome::Applied {
            from: UserState::Absent,
            to: UserState::PresentUnsatisfied
        }
    );
    let welcome = h.drain();
    assert!(matches!(
        notices(&welcome)[0],
        Notice::Welcome { activity_required: true, .. }
    ));

    elapse(120).await;
    h.send(enable("a")).await;
    assert_eq!(h.monitor.state_of("a").await, UserState::PresentSatisfied);

    elapse(480).await;
    h.send(leave("a")).await;
    assert_eq!(h.monitor.state_of("a").await, UserState::Absent);

    elapse(600).await;
    let actions = h.drain();
    assert_eq!(persisted(&actions), vec![600]);
    assert_eq!(removals(&actions), 0);
    assert_eq!(h.monitor.tracked_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exemption_granted_during_grace_prevents_removal() {
    let mut h = Harness::new();

    h.send(join("b")).await;
    elapse(30).await;
    let outcome = h.monitor.resolve_verification(
        "b",
        Some(NetworkVerdict {
            download_mbps: 0.8,
            upload_mbps: 0.3,
            ping_ms: 180.0,
        }),
    );
    assert_eq!(outcome, VerificationOutcome::ExemptionGranted);

    elapse(271).await;
    assert_eq!(h.monitor.state_of("b").await, UserState::PresentExempt);
    assert!(h.monitor.ledger().get("b").is_some());

    elapse(1200).await;
    h.send(leave("b")).await;
    let actions = h.drain();
    assert_eq!(removals(&actions), 0);
    assert_eq!(persisted(&actions), vec![1501]);
}

#[tokio::test(start_paused = true)]
async fn test_disable_restarts_accounting_then_removes() {
    let mut h = Harness::new();

    h.send(join_with_camera("c")).await;
    assert_eq!(h.monitor.state_of("c").await, UserState::PresentSatisfied);

    elapse(180).await;
    h.send(disable("c")).await;
    assert_eq!(h.monitor.state_of("c").await, UserState::PresentUnsatisfied);
    let actions = h.drain();
    assert!(persisted(&actions).is_empty());
    assert!(notices(&actions)
        .iter()
        .any(|n| matches!(n, Notice::ActivityWarning { .. })));

    elapse(299).await;
    assert_eq!(removals(&h.drain()), 0);

    elapse(2).await;
    let actions = h.drain();
    assert_eq!(removals(&actions), 1);
    assert!(persisted(&actions).is_empty());
    assert!(notices(&actions)
        .iter()
        .any(|n| matches!(n, Notice::Inactivity { .. })));
    assert_eq!(h.monitor.state_of("c").await, UserState::Absent);
    assert!(h.monitor.ledger().get("c").is_none());
    assert_eq!(h.monitor.tracked_count(), 0);

    // The platform reports the forced move as a departure afterwards.
    assert_eq!(h.send(leave("c")).await, Outcome::Ignored);
    assert!(persisted(&h.drain()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_persist_policy_keeps_time_before_disable() {
    let mut h = Harness::with_config(MonitorConfig {
        disable_accounting: DisableAccounting::Persist,
        ..MonitorConfig::default()
    });

    h.send(join_with_camera("c")).await;
    elapse(180).await;
    h.send(disable("c")).await;
    assert_eq!(persisted(&h.drain()), vec![180]);

    elapse(60).await;
    h.send(leave("c")).await;
    assert_eq!(persisted(&h.drain()), vec![60]);
}

#[tokio::test(start_paused = true)]
async fn test_join_then_leave_immediately_records_zero() {
    let mut h = Harness::new();
    h.send(join("z")).await;
    h.send(leave("z")).await;
    assert_eq!(persisted(&h.drain()), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn test_leave_cancels_grace_timer() {
    let mut h = Harness::new();
    h.send(join("a")).await;
    elapse(100).await;
    h.send(leave("a")).await;
    elapse(600).await;

    let actions = h.drain();
    assert_eq!(removals(&actions), 0);
    assert_eq!(persisted(&actions), vec![100]);
}

#[tokio::test(start_paused = true)]
async fn test_notices_quote_configured_grace_period() {
    let mut h = Harness::with_config(MonitorConfig {
        grace_period: Duration::from_secs(90),
        ..MonitorConfig::default()
    });

    h.send(join("n")).await;
    assert!(matches!(
        notices(&h.drain())[0],
        Notice::Welcome { grace_minutes: 2, activity_required: true, .. }
    ));

    h.send(enable("n")).await;
    h.send(disable("n")).await;
    let actions = h.drain();
    let warning = notices(&actions)
        .into_iter()
        .find(|n| matches!(n, Notice::ActivityWarning { .. }))
        .unwrap();
    assert!(warning.message().contains("within 2 minutes"));
}

#[tokio::test(start_paused = true)]
async fn test_oversized_grace_period_still_tracks_join() {
    let mut h = Harness::with_config(MonitorConfig {
        grace_period: Duration::MAX,
        exemption_window: Duration::MAX,
        ..MonitorConfig::default()
    });

    h.send(join("g")).await;
    assert_eq!(h.monitor.state_of("g").await, UserState::PresentUnsatisfied);
    assert!(h.monitor.current_timer_id("g").await.is_some());

    elapse(3_600).await;
    h.send(leave("g")).await;
    let actions = h.drain();
    assert_eq!(removals(&actions), 0);
    assert_eq!(persisted(&actions), vec![3_600]);
    assert_eq!(h.monitor.tracked_count(), 0);
}

async fn replay(events: &[(u64, PresenceChange)], twice: bool) -> (UserState, Vec<u64>, usize) {
    let mut h = Harness::new();
    for (wait, event) in events {
        elapse(*wait).await;
        h.send(event.clone()).await;
        if twice {
            h.send(event.clone()).await;
        }
    }
    elapse(1000).await;
    let actions = h.drain();
    (
        h.monitor.state_of("d").await,
        persisted(&actions),
        removals(&actions),
    )
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_delivery_matches_single_delivery() {
    let events = vec![
        (0, join("d")),
        (60, enable("d")),
        (300, disable("d")),
        (100, enable("d")),
        (400, leave("d")),
        (30, join_with_camera("d")),
        (90, disable("d")),
    ];

    let single = replay(&events, false).await;
    let doubled = replay(&events, true).await;
    assert_eq!(single, doubled);
    assert_eq!(single.1, vec![500]);
    assert_eq!(single.2, 1);
    assert_eq!(single.0, UserState::Absent);
}

#[tokio::test(start_paused = true)]
async fn test_replayed_events_report_duplicates() {
    let h = Harness::new();
    h.send(join("d")).await;
    assert_eq!(
        h.send(join("d")).await,
        Outcome::Duplicate {
            state: UserState::PresentUnsatisfied
        }
    );
    h.send(enable("d")).await;
    assert_eq!(
        h.send(enable("d")).await,
        Outcome::Duplicate {
            state: UserState::PresentSatisfied
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_joins_start_one_session() {
    let mut h = Harness::new();
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let monitor = h.monitor.clone();
        tasks.push(tokio::spawn(async move { monitor.handle(&join("e")).await.unwrap() }));
    }

    let mut applied = 0;
    for task in tasks {
        if matches!(task.await.unwrap(), Outcome::Applied { .. }) {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);

    let welcomes = h
        .drain()
        .iter()
        .filter(|a| matches!(a, Outbound::NotifyChannel { notice: Notice::Welcome { .. }, .. }))
        .count();
    assert_eq!(welcomes, 1);

    elapse(301).await;
    assert_eq!(removals(&h.drain()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_fire_after_reenable_is_noop() {
    let mut h = Harness::new();
    h.send(join("f")).await;
    let timer_id = h.monitor.current_timer_id("f").await.unwrap();

    advance(Duration::from_millis(299_999)).await;
    h.send(enable("f")).await;
    h.monitor.fire_grace_timer("f", timer_id).await;

    assert_eq!(h.monitor.state_of("f").await, UserState::PresentSatisfied);
    elapse(10).await;
    assert_eq!(removals(&h.drain()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_restarted_timer_supersedes_first() {
    let mut h = Harness::new();
    h.send(join("g")).await;
    let first = h.monitor.current_timer_id("g").await.unwrap();

    elapse(60).await;
    h.send(enable("g")).await;
    elapse(60).await;
    h.send(disable("g")).await;
    let second = h.monitor.current_timer_id("g").await.unwrap();
    assert_ne!(first, second);

    h.monitor.fire_grace_timer("g", first).await;
    assert_eq!(h.monitor.state_of("g").await, UserState::PresentUnsatisfied);

    elapse(301).await;
    assert_eq!(removals(&h.drain()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exempt_user_joins_without_timer() {
    let mut h = Harness::new();
    h.monitor.exemptions().grant("x");

    h.send(join("x")).await;
    assert_eq!(h.monitor.state_of("x").await, UserState::PresentExempt);
    assert_eq!(h.monitor.current_timer_id("x").await, None);
    let actions = h.drain();
    assert!(matches!(
        notices(&actions)[0],
        Notice::Welcome { activity_required: false, .. }
    ));

    h.send(enable("x")).await;
    h.send(disable("x")).await;
    assert_eq!(h.monitor.state_of("x").await, UserState::PresentExempt);
    let actions = h.drain();
    assert!(!notices(&actions)
        .iter()
        .any(|n| matches!(n, Notice::ActivityWarning { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_ignored_changes() {
    let h = Harness::new();

    let mut bot = join("bot");
    bot.is_bot = true;
    assert_eq!(h.send(bot).await, Outcome::Ignored);

    let mut elsewhere = join("u");
    elsewhere.server_id = "unconfigured".to_string();
    assert_eq!(h.send(elsewhere).await, Outcome::Ignored);

    assert_eq!(h.send(enable("stranger")).await, Outcome::Ignored);
    assert_eq!(h.monitor.tracked_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_verification_without_verdict_denies() {
    let mut h = Harness::new();
    assert_eq!(
        h.monitor.resolve_verification("v", None),
        VerificationOutcome::NoVerdict
    );
    assert!(!h.monitor.exemptions().is_exempt("v"));

    let good = NetworkVerdict {
        download_mbps: 50.0,
        upload_mbps: 20.0,
        ping_ms: 12.0,
    };
    assert_eq!(
        h.monitor.resolve_verification("v", Some(good)),
        VerificationOutcome::GoodConnection
    );
    assert!(!h.monitor.exemptions().is_exempt("v"));

    let actions = h.drain();
    assert_eq!(
        actions,
        vec![
            Outbound::NotifyUser {
                user_id: "v".into(),
                notice: UserNotice::NoVerdict
            },
            Outbound::NotifyUser {
                user_id: "v".into(),
                notice: UserNotice::GoodConnection
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_and_shutdown() {
    let mut h = Harness::new();
    h.send(join("s1")).await;
    h.send(join_with_camera("s2")).await;
    elapse(45).await;

    let views = h.monitor.snapshot().await;
    assert_eq!(views.len(), 2);
    assert_eq!(views[0].user_id, "s1");
    assert_eq!(views[0].grace_remaining_secs, Some(255));
    assert_eq!(views[1].state, UserState::PresentSatisfied);
    assert_eq!(views[1].grace_remaining_secs, None);
    h.drain();

    let closed = h.monitor.shutdown().await;
    assert_eq!(closed.len(), 2);
    assert_eq!(persisted(&h.drain()), vec![45, 45]);
    assert_eq!(h.monitor.tracked_count(), 0);

    elapse(600).await;
    assert_eq!(removals(&h.drain()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_reclaims_expired_grants() {
    let h = Harness::new();
    h.monitor.exemptions().grant("old");
    let sweeper = h.monitor.spawn_exemption_sweeper();
    settle().await;

    elapse(600 + 61).await;
    assert!(h.monitor.exemptions().is_empty());
    sweeper.abort();
}
