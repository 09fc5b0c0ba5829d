//! Application state shared across handlers.

use std::sync::Arc;

use rollcall_core::{
    AttendanceEngine, Config, EngineParts, MemoryStore, RemoteStore, SimulatedGeofence,
    SimulatedLocation, SimulatedPermissions, StoreKind,
};

/// Shared handle passed to every handler.
pub type SharedState = Arc<AppState>;

/// The device this server stands in for.
///
/// Position, authorization and region deliveries are pushed over HTTP.
pub struct SimulatedDevice {
    /// Position fixes.
    pub location: Arc<SimulatedLocation>,
    /// Location authorization.
    pub permissions: Arc<SimulatedPermissions>,
    /// Region monitoring facility.
    pub geofence: Arc<SimulatedGeofence>,
}

impl SimulatedDevice {
    fn new() -> Self {
        Self {
            location: Arc::new(SimulatedLocation::new()),
            permissions: Arc::new(SimulatedPermissions::new()),
            geofence: Arc::new(SimulatedGeofence::new()),
        }
    }
}

/// Application state.
pub struct AppState {
    /// The attendance engine.
    pub engine: AttendanceEngine,
    /// Simulated device collaborators.
    pub device: SimulatedDevice,
    /// In-memory store, when the server runs against one.
    pub memory_store: Option<Arc<MemoryStore>>,
    /// Loaded configuration.
    pub config: Config,
}

impl AppState {
    /// Builds state from configuration, choosing the store by `store.kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the REST store is selected but misconfigured, or
    /// if it is selected in a build without the `rest-store` feature.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        match config.store.kind {
            StoreKind::Memory => {
                let store = Arc::new(MemoryStore::new());
                Ok(Self::build(config, store.clone(), Some(store)))
            }
            StoreKind::Rest => Self::with_rest_store(config),
        }
    }

    /// Builds state around an in-memory store.
    #[must_use]
    pub fn in_memory(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::build(config, store.clone(), Some(store))
    }

    #[cfg(feature = "rest-store")]
    fn with_rest_store(config: Config) -> anyhow::Result<Self> {
        let store = rollcall_core::RestStore::from_config(
            &config.store,
            config.engine.repository_timeout(),
        )?;
        Ok(Self::build(config, Arc::new(store), None))
    }

    #[cfg(not(feature = "rest-store"))]
    fn with_rest_store(_config: Config) -> anyhow::Result<Self> {
        anyhow::bail!("store.kind = \"rest\" requires the rest-store feature")
    }

    fn build(
        config: Config,
        store: Arc<dyn RemoteStore>,
        memory_store: Option<Arc<MemoryStore>>,
    ) -> Self {
        let device = SimulatedDevice::new();
        let engine = AttendanceEngine::new(
            config.engine.clone(),
            EngineParts {
                store,
                location: device.location.clone(),
                permissions: device.permissions.clone(),
                geofence: device.geofence.clone(),
            },
        );
        Self {
            engine,
            device,
            memory_store,
            config,
        }
    }

    /// Wraps the state for sharing.
    #[must_use]
    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::StoreConfig;

    fn rest_config(base_url: Option<&str>) -> Config {
        Config {
            store: StoreConfig {
                kind: StoreKind::Rest,
                base_url: base_url.map(str::to_string),
                api_key: None,
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_memory_store_by_default() {
        let state = AppState::from_config(Config::default()).unwrap();
        assert!(state.memory_store.is_some());
        assert!(!state.engine.is_monitoring());
    }

    #[cfg(feature = "rest-store")]
    #[test]
    fn test_rest_store_selected_by_kind() {
        let state = AppState::from_config(rest_config(Some("http://localhost:54321"))).unwrap();
        assert!(state.memory_store.is_none());

        assert!(AppState::from_config(rest_config(None)).is_err());
    }

    #[cfg(not(feature = "rest-store"))]
    #[test]
    fn test_rest_store_needs_feature() {
        let err = AppState::from_config(rest_config(Some("http://localhost:54321")))
            .err()
            .unwrap();
        assert!(err.to_string().contains("rest-store"));
    }
}
