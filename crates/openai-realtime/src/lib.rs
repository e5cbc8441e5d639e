//! OpenAI Realtime API wire vocabulary and WebSocket connector.
//!
//! `types` holds the closed set of client and server events exchanged with
//! the realtime endpoint. `client` opens the connection and hands back a
//! transport-agnostic [`RealtimeLink`] of JSON text frames.

pub mod client;
pub mod types;

pub use client::{RealtimeConfig, RealtimeLink, connect};
pub use types::{ClientEvent, ServerEvent};
