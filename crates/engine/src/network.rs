//! Network availability probe.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Connectivity state reported by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Network reachable.
    Online,
    /// Network unreachable.
    Offline,
}

/// Tells the engine whether jobs that need the network may proceed.
pub trait NetworkAvailability: Send + Sync {
    fn is_available(&self) -> bool;

    /// Verify the process may use the network at all.
    ///
    /// Called once when the engine is built; an error aborts construction.
    fn check_capability(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Manually toggled availability, for tests and embedders with their own
/// connectivity monitoring.
#[derive(Debug)]
pub struct StaticNetwork {
    online: AtomicBool,
    missing_capability: Option<String>,
}

impl StaticNetwork {
    pub fn online() -> Self {
        Self {
            online: AtomicBool::new(true),
            missing_capability: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            online: AtomicBool::new(false),
            missing_capability: None,
        }
    }

    /// Make `check_capability` fail with `reason`.
    pub fn without_capability(mut self, reason: impl Into<String>) -> Self {
        self.missing_capability = Some(reason.into());
        self
    }

    pub fn state(&self) -> ConnectivityState {
        if self.online.load(Ordering::Acquire) {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }

    /// Mark the network as offline.
    pub fn set_offline(&self) {
        self.online.store(false, Ordering::Release);
    }

    /// Mark the network as online.
    pub fn set_online(&self) {
        self.online.store(true, Ordering::Release);
    }
}

impl Default for StaticNetwork {
    fn default() -> Self {
        Self::online()
    }
}

impl NetworkAvailability for StaticNetwork {
    fn is_available(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    fn check_capability(&self) -> Result<(), EngineError> {
        match &self.missing_capability {
            Some(reason) => Err(EngineError::configuration(reason.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggles_between_states() {
        let network = StaticNetwork::online();
        assert!(network.is_available());

        network.set_offline();
        assert_eq!(network.state(), ConnectivityState::Offline);
        assert!(!network.is_available());

        network.set_online();
        assert!(network.is_available());
    }

    #[test]
    fn missing_capability_is_a_configuration_error() {
        let network = StaticNetwork::online().without_capability("network permission missing");
        let err = network.check_capability().unwrap_err();
        assert!(matches!(err, EngineError::Configuration(msg) if msg.contains("permission")));
    }
}
