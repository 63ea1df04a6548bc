//! # aqe-core
//!
//! Core types, error taxonomy, and primitives shared by every crate in the
//! AQE learning and shared-memory workspace.

pub mod error;
pub mod event;
pub mod types;

pub use error::{AqeError, Result};
pub use event::{Event, EventBus};
pub use types::*;
