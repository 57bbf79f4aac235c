//! Application layer: command handlers and the binary's error type.

pub mod commands;
pub mod error;
