//! Shared foundation for the courier mail dispatch worker.
//!
//! This crate holds the pieces every other crate leans on: the YAML
//! configuration model, logging bootstrap, and the structured operator
//! event sink that mirrors log lines onto a side queue of the message bus.

pub mod config;
pub mod events;
pub mod logging;
