//! Ticket triage worker
//!
//! One process hosts the HTTP API, the processing pipeline and the
//! broadcast hub that relays ticket updates to WebSocket observers.

pub mod api;
pub mod app;
pub mod config;
