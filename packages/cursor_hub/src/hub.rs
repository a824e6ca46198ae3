//! The running hub: registry, coordinator and settings, constructed once by
//! the startup routine and passed to every connection.

use anyhow::Result;
use std::sync::Arc;

use crate::config::HubSettings;
use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::registry::Registry;
use crate::stats::CoordinatorStatsSnapshot;

#[derive(Clone)]
pub struct Hub {
    registry: Arc<Registry>,
    coordinator: CoordinatorHandle,
    settings: Arc<HubSettings>,
}

impl Hub {
    /// Validate `settings` and spawn the coordinator. Must be called inside a
    /// tokio runtime.
    pub fn start(settings: HubSettings) -> Result<Self> {
        settings.validate()?;

        let registry = Arc::new(Registry::new());
        let coordinator = Coordinator::spawn(registry.clone(), settings.tick_interval);
        Ok(Self {
            registry,
            coordinator,
            settings: Arc::new(settings),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        self.coordinator.stats().snapshot()
    }
}
