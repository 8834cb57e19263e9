//! StreamContext - explicit environment of every stream endpoint

use std::sync::Arc;

use contracts::{NetworkConfig, Result};
use timesync::Clock;

/// Clock and network settings shared by the outlets, inlets and resolvers of
/// one application. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct StreamContext {
    clock: Clock,
    network: Arc<NetworkConfig>,
    hostname: Arc<str>,
}

impl StreamContext {
    /// Context with a fresh clock.
    ///
    /// # Errors
    /// `ConfigValidation` when the network settings are unusable.
    pub fn new(network: NetworkConfig) -> Result<Self> {
        Self::with_clock(network, Clock::new())
    }

    pub fn with_clock(network: NetworkConfig, clock: Clock) -> Result<Self> {
        network.validate()?;
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self {
            clock,
            network: Arc::new(network),
            hostname: Arc::from(hostname),
        })
    }

    /// Same network, different clock (models another machine)
    pub fn with_shifted_clock(&self, offset: f64) -> Self {
        Self {
            clock: self.clock.shifted(offset),
            ..self.clone()
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}
