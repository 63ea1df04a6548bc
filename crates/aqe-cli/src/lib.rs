//! # aqe-cli
//!
//! Command-line interface over the AQE learning store and shared memory.
//!
//! ## Commands
//!
//! - `aqe memory` : store, read, search and purge shared-memory entries
//! - `aqe session` : open, close and list learning sessions
//! - `aqe qtable` : inspect, reset and summarize learned values
//! - `aqe trajectory` : replay a session's transitions
//! - `aqe decide` / `aqe reward` : run the policy and reward function by hand
//! - `aqe config` / `aqe set` / `aqe doctor` / `aqe init` : configuration

pub mod commands;

pub use commands::Cli;
