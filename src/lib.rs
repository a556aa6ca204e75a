//! cmdguard: validates, risk-assesses, simulates, executes and reverses
//! system-mutating commands on behalf of a user.
//!
//! A [`Plan`] of typed [`Command`]s is driven through
//! validate → confirm → snapshot → execute by a [`Session`], which records
//! every transition in a hash-chained audit log and keeps an undo stack
//! per session.

pub mod audit;
pub mod backup;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod fsutil;
pub mod session;
pub mod ui;

pub use command::{Command, CommandKind};
pub use config::{Config, SandboxMode};
pub use error::{GuardError, Result};
pub use executor::{Plan, PlanReport, RiskLevel};
pub use session::Session;
