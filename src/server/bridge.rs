//! [`Platform`] implementation that forwards outbound actions to the chat
//! bridge over the `/ws/bridge` feed.
//!
//! Delivery is fire-and-forget: an action succeeds once at least one
//! bridge connection has received it.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::error::PlatformError;
use crate::feed::{self, EventFeed};
use crate::monitor::{Notice, Platform, UserNotice};

#[derive(Debug, Clone)]
pub struct BridgePlatform {
    feed: EventFeed,
}

#[derive(Serialize)]
struct ChannelCommand<'a> {
    channel_id: &'a str,
    message: String,
    notice: &'a Notice,
    delete_after_secs: u64,
}

#[derive(Serialize)]
struct UserCommand<'a> {
    user_id: &'a str,
    message: String,
    notice: &'a UserNotice,
}

#[derive(Serialize)]
struct DisconnectCommand<'a> {
    server_id: &'a str,
    user_id: &'a str,
}

impl BridgePlatform {
    pub fn new(feed: EventFeed) -> Self {
        Self { feed }
    }

    fn push(&self, command: &str, data: &impl Serialize) -> Result<(), PlatformError> {
        if feed::publish(&self.feed, command, data) {
            Ok(())
        } else {
            Err(PlatformError::NoBridge)
        }
    }
}

#[async_trait]
impl Platform for BridgePlatform {
    async fn notify_channel(
        &self,
        channel_id: &str,
        notice: &Notice,
        delete_after: Duration,
    ) -> Result<(), PlatformError> {
        self.push(
            "notify_channel",
            &ChannelCommand {
                channel_id,
                message: notice.message(),
                notice,
                delete_after_secs: delete_after.as_secs(),
            },
        )
    }

    async fn notify_user(&self, user_id: &str, notice: &UserNotice) -> Result<(), PlatformError> {
        self.push(
            "notify_user",
            &UserCommand {
                user_id,
                message: notice.message(),
                notice,
            },
        )
    }

    async fn force_disconnect(&self, server_id: &str, user_id: &str) -> Result<(), PlatformError> {
        self.push("force_disconnect", &DisconnectCommand { server_id, user_id })
    }
}
