//! Voicebot Core
//!
//! The side effects a realtime voice conversation may request mid-turn,
//! exposed behind one uniform [`capability::CapabilityProvider`] contract:
//!
//! - `knowledge`: document index and the knowledge-base search capability.
//! - `workflow`: the multi-step workflow simulator.
//! - `external_api`: declarative endpoint catalog and the HTTP bridge.

pub mod capability;
pub mod external_api;
pub mod knowledge;
pub mod workflow;

pub use capability::{
    CapabilityDeclaration, CapabilityError, CapabilityProvider, CapabilityResult, CapabilitySet,
};
