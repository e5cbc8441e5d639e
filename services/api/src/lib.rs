//! Voicebot API Library Crate
//!
//! This library contains all the logic for the voice assistant web service:
//! configuration, session profiles, application state, REST handlers, the
//! WebSocket relay and routing. The `api` binary is a thin wrapper around it.

pub mod config;
pub mod handlers;
pub mod models;
pub mod profile;
pub mod router;
pub mod state;
pub mod ws;
