//! Fieldlink IoT cloud connector library.
//! This crate exposes internal modules for embedders and integration
//! testing. The binary entry point is in main.rs.

pub mod api;
pub mod bus;
pub mod config;
pub mod connections;
pub mod correlator;
pub mod error;
pub mod events;
pub mod metrics;
pub mod registry;
pub mod supervisor;
pub mod ws;
