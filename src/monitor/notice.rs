//! Notifications the monitor emits.

use serde::Serialize;

/// Notice posted to the study channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    Welcome {
        user_id: String,
        display_name: String,
        /// The user still has to turn on a camera or screen share.
        activity_required: bool,
        /// Length of the grace period, rounded up to whole minutes.
        grace_minutes: u64,
    },
    Departure {
        user_id: String,
        display_name: String,
    },
    BreakHint {
        user_id: String,
    },
    ActivityConfirmed {
        user_id: String,
    },
    ActivityWarning {
        user_id: String,
        grace_minutes: u64,
    },
    Inactivity {
        user_id: String,
    },
}

impl Notice {
    pub fn user_id(&self) -> &str {
        match self {
            Notice::Welcome { user_id, .. }
            | Notice::Departure { user_id, .. }
            | Notice::BreakHint { user_id }
            | Notice::ActivityConfirmed { user_id }
            | Notice::ActivityWarning { user_id, .. }
            | Notice::Inactivity { user_id } => user_id,
        }
    }

    /// Plain-text rendering for bridges that do not format notices.
    pub fn message(&self) -> String {
        match self {
            Notice::Welcome {
                user_id,
                display_name,
                activity_required,
                grace_minutes,
            } => {
                let mut text = format!(
                    "{} is back! Welcome back <@{}>, study time resumes.",
                    display_name, user_id
                );
                if *activity_required {
                    text.push_str(&format!(
                        " Please turn on your camera or screen share within {} or you may be removed.",
                        minutes(*grace_minutes)
                    ));
                }
                text
            }
            Notice::Departure { display_name, .. } => {
                format!("{} left the study channel.", display_name)
            }
            Notice::BreakHint { user_id } => format!("<@{}> might be on a break.", user_id),
            Notice::ActivityConfirmed { user_id } => {
                format!("<@{}>'s activity detected!", user_id)
            }
            Notice::ActivityWarning {
                user_id,
                grace_minutes,
            } => format!(
                "<@{}>, you turned off your camera or screen share. Turn it back on within {} or you will be removed.",
                user_id,
                minutes(*grace_minutes)
            ),
            Notice::Inactivity { user_id } => format!("<@{}> inactivity detected.", user_id),
        }
    }
}

fn minutes(count: u64) -> String {
    if count == 1 {
        "1 minute".to_string()
    } else {
        format!("{} minutes", count)
    }
}

/// Direct message to a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UserNotice {
    GoodConnection,
    ExemptionGranted { minutes: u64 },
    NoVerdict,
}

impl UserNotice {
    pub fn message(&self) -> String {
        match self {
            UserNotice::GoodConnection => {
                "Your connection looks fine, so no exemption was granted.".to_string()
            }
            UserNotice::ExemptionGranted { minutes } => {
                format!("{} minute exemption from the camera requirement granted.", minutes)
            }
            UserNotice::NoVerdict => {
                "No network check result arrived in time, so no exemption was granted.".to_string()
            }
        }
    }
}
