//! WebSocket Session Relay
//!
//! This module contains the realtime relay between browser clients and the
//! upstream voice model. It is structured into submodules:
//!
//! - `protocol`: the JSON message format spoken with the browser.
//! - `session`: axum upgrade handlers and the socket writer.
//! - `relay`: the per-session supervisor, client pump and upstream event router.
//! - `transcript`: user-turn transcript accumulation.
//! - `dispatch`: function-call deduplication and background execution.
//! - `provider`: the upstream connection, handshake and outbound writer.
//! - `registry`: the process-wide table of live sessions.

pub mod dispatch;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod relay;
pub mod session;
pub mod transcript;

pub use session::{assistant_ws, realtime_ws, rtc_ws};
