//! Route handlers module.

pub mod config;
pub mod exemptions;
pub mod health;
pub mod leaderboard;
pub mod learners;
pub mod monitor;
pub mod presence;
pub mod servers;
pub mod verification;
