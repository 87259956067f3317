//! Presence event normalization.
//!
//! Turns a raw before/after voice-state pair into one semantic
//! transition relative to the server's monitored channel.

use serde::{Deserialize, Serialize};

/// One side of a voice-state change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceSnapshot {
    /// Channel the user is connected to, if any.
    pub channel_id: Option<String>,

    /// Screen share flag.
    #[serde(default)]
    pub streaming: bool,

    /// Camera flag.
    #[serde(default)]
    pub video: bool,
}

impl VoiceSnapshot {
    pub fn in_channel(channel_id: &str) -> Self {
        Self {
            channel_id: Some(channel_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_stream(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_video(mut self, video: bool) -> Self {
        self.video = video;
        self
    }

    /// Camera or screen share is on.
    pub fn is_active(&self) -> bool {
        self.streaming || self.video
    }

    fn is_in(&self, channel_id: &str) -> bool {
        self.channel_id.as_deref() == Some(channel_id)
    }
}

/// A presence change as delivered by the platform bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceChange {
    pub user_id: String,
    pub server_id: String,

    /// Name used in notifications and leaderboards.
    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub is_bot: bool,

    pub before: VoiceSnapshot,
    pub after: VoiceSnapshot,
}

/// Semantic transition produced by [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Joined { user_id: String, channel_id: String },
    Left { user_id: String, channel_id: String },
    ActivityEnabled { user_id: String },
    ActivityDisabled { user_id: String },
    Ignore,
}

/// Classifies a presence change against the monitored channel.
///
/// Joined/Left win over flag changes carried by the same event. Bots and
/// servers without a monitored channel always yield [`Transition::Ignore`].
pub fn normalize(change: &PresenceChange, monitored: Option<&str>) -> Transition {
    if change.is_bot {
        return Transition::Ignore;
    }
    let Some(monitored) = monitored else {
        return Transition::Ignore;
    };

    let was_in = change.before.is_in(monitored);
    let is_in = change.after.is_in(monitored);

    match (was_in, is_in) {
        (false, true) => Transition::Joined {
            user_id: change.user_id.clone(),
            channel_id: monitored.to_string(),
        },
        (true, false) => Transition::Left {
            user_id: change.user_id.clone(),
            channel_id: monitored.to_string(),
        },
        (true, true) => match (change.before.is_active(), change.after.is_active()) {
            (false, true) => Transition::ActivityEnabled {
                user_id: change.user_id.clone(),
            },
            (true, false) => Transition::ActivityDisabled {
                user_id: change.user_id.clone(),
            },
            _ => Transition::Ignore,
        },
        (false, false) => Transition::Ignore,
    }
}
