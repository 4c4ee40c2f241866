// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Composition root.  Builds every component once, wires them together with
// explicit handles, and owns them for the life of the process.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use printlink_bridge::PlatformBridge;
use printlink_core::config::EngineConfig;
use printlink_core::error::{PrintlinkError, Result};
use printlink_net::{CommandTransport, HttpCommandClient, RealtimeConnector, WsConnector};

use crate::cloud::CloudSyncAgent;
use crate::companion::CompanionLink;
use crate::connection::ConnectionManager;
use crate::dispatcher::{EventConsumer, EventDispatcher, SubscriptionId};
use crate::poller::BackgroundPoller;
use crate::registry::PrinterRegistry;
use crate::store::RegistryStore;

pub struct Engine {
    config: EngineConfig,
    platform: String,
    dispatcher: EventDispatcher,
    registry: Arc<PrinterRegistry>,
    connections: ConnectionManager,
    poller: BackgroundPoller,
    cloud: Arc<CloudSyncAgent>,
    companion: Arc<CompanionLink>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("platform", &self.platform)
            .field("registry", &self.registry)
            .field("connections", &self.connections)
            .field("cloud", &self.cloud)
            .finish()
    }
}

impl Engine {
    /// Assemble the engine from explicit parts.  Must be called within a
    /// Tokio runtime.
    pub fn new(
        config: EngineConfig,
        store: RegistryStore,
        connector: Arc<dyn RealtimeConnector>,
        transport: Arc<dyn CommandTransport>,
        bridge: Arc<dyn PlatformBridge>,
    ) -> Result<Self> {
        config.validate()?;

        let dispatcher = EventDispatcher::new();
        let registry = Arc::new(PrinterRegistry::new(store, dispatcher.clone())?);
        let connections =
            ConnectionManager::new(connector, transport, dispatcher.clone(), config.clone());
        let poller = BackgroundPoller::new(registry.clone(), connections.clone());
        let cloud = Arc::new(CloudSyncAgent::new(
            bridge.cloud(),
            registry.clone(),
            config.cloud_subscription_id.clone(),
        ));
        let companion = CompanionLink::new(
            bridge.companion(),
            registry.clone(),
            connections.clone(),
            dispatcher.clone(),
            config.companion_enabled,
        );

        info!(platform = bridge.platform_name(), "engine assembled");
        Ok(Self {
            config,
            platform: bridge.platform_name().to_owned(),
            dispatcher,
            registry,
            connections,
            poller,
            cloud,
            companion,
        })
    }

    /// Production wiring: SQLite at `db_path`, websocket realtime channel,
    /// HTTP commands.
    pub fn open(config: EngineConfig, db_path: &Path, bridge: Arc<dyn PlatformBridge>) -> Result<Self> {
        let store = RegistryStore::open(db_path)?;
        Self::with_network(config, store, bridge)
    }

    /// Like [`open`](Self::open) but with a throwaway in-memory registry.
    pub fn open_in_memory(config: EngineConfig, bridge: Arc<dyn PlatformBridge>) -> Result<Self> {
        let store = RegistryStore::open_in_memory()?;
        Self::with_network(config, store, bridge)
    }

    fn with_network(
        config: EngineConfig,
        store: RegistryStore,
        bridge: Arc<dyn PlatformBridge>,
    ) -> Result<Self> {
        let transport = HttpCommandClient::new(config.command_timeout())?;
        Self::new(
            config,
            store,
            Arc::new(WsConnector::new()?),
            Arc::new(transport),
            bridge,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn platform_name(&self) -> &str {
        &self.platform
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<PrinterRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn poller(&self) -> &BackgroundPoller {
        &self.poller
    }

    pub fn cloud(&self) -> &CloudSyncAgent {
        &self.cloud
    }

    pub fn companion(&self) -> &Arc<CompanionLink> {
        &self.companion
    }

    pub fn subscribe<C: EventConsumer + 'static>(&self, consumer: &Arc<C>) -> SubscriptionId {
        self.dispatcher.subscribe(consumer)
    }

    /// Make sure the live session serves the default target, switching away
    /// from any other target.
    pub async fn connect_default(&self) -> Result<()> {
        let target = self
            .registry
            .get_default()
            .ok_or(PrintlinkError::NoDefaultTarget)?;
        match self.connections.connect(target.clone()).await {
            Err(PrintlinkError::AlreadyConnecting { current, .. }) => {
                debug!(%current, "session serves a stale target; switching");
                self.connections.switch_to(target).await;
                Ok(())
            }
            other => other,
        }
    }

    /// Stop the session and the upload worker, then drain pending events.
    pub async fn shutdown(&self) {
        self.connections.disconnect().await;
        self.cloud.stop();
        self.dispatcher.flush().await;
        info!("engine shut down");
    }
}
