//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the process-wide
//! collaborators every session and handler works with.

use crate::{
    config::Config,
    profile::{ProfileKind, SessionProfile},
    ws::{provider::UpstreamConnector, registry::SessionRegistry, relay::SessionContext},
};
use std::sync::Arc;
use uuid::Uuid;
use voicebot_core::{
    CapabilitySet,
    external_api::{EndpointCatalog, ExternalApiBridge, ExternalApiCapability},
    knowledge::{KnowledgeBase, KnowledgeSearchCapability},
    workflow::WorkflowSimulator,
};

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub knowledge: KnowledgeBase,
    pub catalog: Arc<EndpointCatalog>,
    pub bridge: ExternalApiBridge,
    /// Every capability the process offers; sessions get a profile subset.
    pub capabilities: CapabilitySet,
    pub connector: Arc<dyn UpstreamConnector>,
}

impl AppState {
    pub fn new(
        config: Config,
        catalog: EndpointCatalog,
        knowledge: KnowledgeBase,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let bridge =
            ExternalApiBridge::new(catalog.clone()).with_timeout(config.capability_timeout);

        let capabilities = CapabilitySet::new(config.capability_timeout)
            .with(Arc::new(KnowledgeSearchCapability::new(knowledge.clone())))
            .with(Arc::new(ExternalApiCapability::new(bridge.clone())))
            .with(Arc::new(
                WorkflowSimulator::new(config.workflow_step_delay)
                    .with_timeout(config.slow_capability_timeout),
            ));

        Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            knowledge,
            catalog,
            bridge,
            capabilities,
            connector,
        }
    }

    pub fn profile(&self, kind: ProfileKind) -> SessionProfile {
        let profile = SessionProfile::for_kind(kind);
        if self.config.server_vad {
            profile
        } else {
            profile.without_vad()
        }
    }

    /// Builds the context for a new session on the given route.
    pub fn session_context(&self, session_id: Uuid, kind: ProfileKind) -> SessionContext {
        let profile = self.profile(kind);
        SessionContext {
            session_id,
            capabilities: self.capabilities.subset(profile.capabilities),
            profile,
            catalog: self.catalog.clone(),
            knowledge: self.knowledge.clone(),
            connector: self.connector.clone(),
            registry: self.registry.clone(),
            handshake_timeout: self.config.handshake_timeout,
        }
    }
}
