//! StudyMon - study-room activity monitor.
//!
//! Watches a monitored voice channel per server, gives each member a grace
//! period to turn on a camera or screen share, removes members who don't,
//! and accumulates study time per learner.

pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod feed;
pub mod monitor;
pub mod server;
pub mod verify;
