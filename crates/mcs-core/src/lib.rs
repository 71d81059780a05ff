//! Core routing + reconciliation logic for the multi-department support chat.
//!
//! This crate is intentionally framework-agnostic. The Matrix backend and the
//! Telegram channel live behind ports (traits) implemented in adapter crates.

pub mod backend;
pub mod bridge;
pub mod channel;
pub mod client;
pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod mapping;
pub mod relay;
pub mod session;
pub mod spaces;

pub use errors::{Error, Result};
