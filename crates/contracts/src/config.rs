//! Stream configuration contracts shared across crates.

use std::net::{IpAddr, Ipv4Addr};
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Result, StreamError};

/// Timeout meaning "wait as long as it takes"
pub const FOREVER: Duration = Duration::from_secs(32_000_000);

// ========== Network ==========

/// Where outlets listen and where resolvers look
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// First UDP service port tried by outlets
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Number of consecutive service ports
    #[serde(default = "default_port_range")]
    pub port_range: u16,

    /// Hosts queried by unicast on every service port
    #[serde(default = "default_known_peers")]
    pub known_peers: Vec<IpAddr>,

    /// Multicast group queried in addition to the peers
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Option<Ipv4Addr>,

    /// Address outlets bind their sockets to
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,

    /// Spacing of query waves during one-shot resolves (ms)
    #[serde(default = "default_wave_interval_ms")]
    pub wave_interval_ms: u64,

    /// Time probes per clock-offset wave
    #[serde(default = "default_time_probe_count")]
    pub time_probe_count: usize,

    /// Spacing of background clock-offset waves (seconds)
    #[serde(default = "default_time_update_interval_secs")]
    pub time_update_interval_secs: f64,
}

fn default_base_port() -> u16 {
    16572
}

fn default_port_range() -> u16 {
    32
}

fn default_known_peers() -> Vec<IpAddr> {
    vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
}

fn default_multicast_group() -> Option<Ipv4Addr> {
    Some(Ipv4Addr::new(239, 255, 172, 215))
}

fn default_listen_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_wave_interval_ms() -> u64 {
    100
}

fn default_time_probe_count() -> usize {
    8
}

fn default_time_update_interval_secs() -> f64 {
    2.0
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            port_range: default_port_range(),
            known_peers: default_known_peers(),
            multicast_group: default_multicast_group(),
            listen_address: default_listen_address(),
            wave_interval_ms: default_wave_interval_ms(),
            time_probe_count: default_time_probe_count(),
            time_update_interval_secs: default_time_update_interval_secs(),
        }
    }
}

impl NetworkConfig {
    /// Loopback-only network on a private port range, no multicast
    pub fn loopback(base_port: u16, port_range: u16) -> Self {
        Self {
            base_port,
            port_range,
            known_peers: default_known_peers(),
            multicast_group: None,
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default()
        }
    }

    /// Service ports in probing order
    pub fn service_ports(&self) -> impl Iterator<Item = u16> {
        let end = self.base_port.saturating_add(self.port_range);
        self.base_port..end
    }

    pub fn wave_interval(&self) -> Duration {
        Duration::from_millis(self.wave_interval_ms)
    }

    pub fn time_update_interval(&self) -> Duration {
        Duration::from_secs_f64(self.time_update_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_range == 0 {
            return Err(StreamError::config_validation(
                "network.port_range",
                "must be at least 1",
            ));
        }
        if u32::from(self.base_port) + u32::from(self.port_range) > u32::from(u16::MAX) + 1 {
            return Err(StreamError::config_validation(
                "network.port_range",
                "base_port + port_range exceeds the port space",
            ));
        }
        if self.known_peers.is_empty() && self.multicast_group.is_none() {
            return Err(StreamError::config_validation(
                "network.known_peers",
                "no peers and no multicast group: nothing can be discovered",
            ));
        }
        if self.time_probe_count == 0 {
            return Err(StreamError::config_validation(
                "network.time_probe_count",
                "must be at least 1",
            ));
        }
        if !(self.time_update_interval_secs.is_finite() && self.time_update_interval_secs > 0.0) {
            return Err(StreamError::config_validation(
                "network.time_update_interval_secs",
                "must be positive",
            ));
        }
        Ok(())
    }
}

// ========== Outlet / Inlet ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutletConfig {
    /// Samples per transmitted chunk, 0 = transmit on every push
    #[serde(default)]
    pub chunk_size: usize,

    /// Backlog kept per consumer (seconds of data)
    #[serde(default = "default_max_buffered")]
    pub max_buffered: f64,
}

fn default_max_buffered() -> f64 {
    360.0
}

impl Default for OutletConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            max_buffered: default_max_buffered(),
        }
    }
}

impl OutletConfig {
    pub fn validate(&self) -> Result<()> {
        validate_max_buffered("outlet.max_buffered", self.max_buffered)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InletConfig {
    /// Backlog buffered locally (seconds of data)
    #[serde(default = "default_max_buffered")]
    pub max_buffered: f64,

    /// Preferred chunk granularity, 0 = sender's choice
    #[serde(default)]
    pub max_chunk_len: usize,

    /// Reconnect silently to a restarted source with the same source id
    #[serde(default = "default_recover")]
    pub recover: bool,

    #[serde(default)]
    pub postproc: PostProcessing,
}

fn default_recover() -> bool {
    true
}

impl Default for InletConfig {
    fn default() -> Self {
        Self {
            max_buffered: default_max_buffered(),
            max_chunk_len: 0,
            recover: default_recover(),
            postproc: PostProcessing::NONE,
        }
    }
}

impl InletConfig {
    pub fn validate(&self) -> Result<()> {
        validate_max_buffered("inlet.max_buffered", self.max_buffered)
    }
}

fn validate_max_buffered(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(StreamError::config_validation(
            field,
            format!("must be a positive number of seconds, got {value}"),
        ))
    }
}

// ========== Resolver ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Interval between background query waves (ms)
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Entries not re-sighted for this long are dropped (seconds)
    #[serde(default = "default_forget_after_secs")]
    pub forget_after_secs: f64,
}

fn default_probe_interval_ms() -> u64 {
    50
}

fn default_forget_after_secs() -> f64 {
    2.0
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            forget_after_secs: default_forget_after_secs(),
        }
    }
}

impl ResolverConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn forget_after(&self) -> Duration {
        Duration::from_secs_f64(self.forget_after_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.probe_interval_ms == 0 {
            return Err(StreamError::config_validation(
                "resolver.probe_interval_ms",
                "must be at least 1",
            ));
        }
        if !(self.forget_after_secs.is_finite() && self.forget_after_secs > 0.0) {
            return Err(StreamError::config_validation(
                "resolver.forget_after_secs",
                "must be positive",
            ));
        }
        Ok(())
    }
}

// ========== Post-processing flags ==========

/// Timestamp post-processing flags of an inlet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PostProcessing(u32);

impl PostProcessing {
    pub const NONE: Self = Self(0);
    /// Add the current clock offset
    pub const CLOCKSYNC: Self = Self(1);
    /// Smooth timestamps against the sample index
    pub const DEJITTER: Self = Self(2);
    /// Force non-decreasing timestamps
    pub const MONOTONIZE: Self = Self(4);
    /// Serialize whole pulls under the post-processor lock
    pub const THREADSAFE: Self = Self(8);
    pub const ALL: Self = Self(15);

    const NAMES: [(&'static str, Self); 4] = [
        ("clocksync", Self::CLOCKSYNC),
        ("dejitter", Self::DEJITTER),
        ("monotonize", Self::MONOTONIZE),
        ("threadsafe", Self::THREADSAFE),
    ];

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Flag names, in canonical order
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }

    /// Parse one flag name (`all` and `none` accepted)
    pub fn parse_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::NONE),
            "all" => Some(Self::ALL),
            other => Self::NAMES
                .iter()
                .find(|(n, _)| *n == other)
                .map(|(_, flag)| *flag),
        }
    }
}

impl BitOr for PostProcessing {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PostProcessing {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Serialize for PostProcessing {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PostProcessing {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        names.iter().try_fold(Self::NONE, |acc, name| {
            Self::parse_name(name)
                .map(|flag| acc | flag)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown post-processing flag '{name}'")))
        })
    }
}

// ========== Adaptive Kalman filter ==========

/// AdaKF (Adaptive Kalman Filter) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaKFConfig {
    /// Initial level estimate
    pub initial_offset: f64,
    /// Initial slope estimate (level change per step)
    #[serde(default)]
    pub initial_drift: f64,
    /// Process noise (Q)
    pub process_noise: f64,
    /// Measurement noise (R)
    pub measurement_noise: f64,
    /// Residual window size for adaptive tuning
    pub residual_window: usize,
    /// Step used when the caller passes no usable `dt`
    pub expected_interval: Option<f64>,
}

impl Default for AdaKFConfig {
    fn default() -> Self {
        Self {
            initial_offset: 0.0,
            initial_drift: 0.0,
            process_noise: 0.0001,
            measurement_noise: 0.001,
            residual_window: 20,
            expected_interval: None,
        }
    }
}

impl AdaKFConfig {
    /// Clock-offset smoothing over probe waves
    pub fn clock_offset(initial_offset: f64) -> Self {
        Self {
            initial_offset,
            process_noise: 1e-8,
            measurement_noise: 1e-6,
            ..Self::default()
        }
    }

    /// Timestamp-vs-index smoothing for a stream with the given period
    pub fn dejitter(first_timestamp: f64, period: f64) -> Self {
        Self {
            initial_offset: first_timestamp,
            initial_drift: period,
            process_noise: 1e-10,
            measurement_noise: (period * 0.1).powi(2).max(1e-8),
            residual_window: 50,
            expected_interval: Some(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let inlet = InletConfig::default();
        assert_eq!(inlet.max_buffered, 360.0);
        assert!(inlet.recover);
        assert_eq!(inlet.postproc, PostProcessing::NONE);

        let resolver = ResolverConfig::default();
        assert_eq!(resolver.probe_interval(), Duration::from_millis(50));
        assert_eq!(resolver.forget_after(), Duration::from_secs(2));

        let network = NetworkConfig::default();
        assert_eq!(network.service_ports().count(), 32);
        assert!(network.validate().is_ok());
    }

    #[test]
    fn test_invalid_buffers_rejected() {
        let outlet = OutletConfig {
            chunk_size: 0,
            max_buffered: 0.0,
        };
        assert!(matches!(
            outlet.validate(),
            Err(StreamError::ConfigValidation { .. })
        ));
        let inlet = InletConfig {
            max_buffered: f64::NAN,
            ..InletConfig::default()
        };
        assert!(inlet.validate().is_err());
    }

    #[test]
    fn test_port_space_overflow() {
        let network = NetworkConfig {
            base_port: 65530,
            port_range: 32,
            ..NetworkConfig::default()
        };
        assert!(network.validate().is_err());
    }

    #[test]
    fn test_postprocessing_flags() {
        let flags = PostProcessing::CLOCKSYNC | PostProcessing::DEJITTER;
        assert!(flags.contains(PostProcessing::DEJITTER));
        assert!(!flags.contains(PostProcessing::MONOTONIZE));
        assert_eq!(flags.names(), vec!["clocksync", "dejitter"]);
        assert_eq!(PostProcessing::ALL.names().len(), 4);
        assert_eq!(PostProcessing::from_bits(0xff), PostProcessing::ALL);
    }

    #[test]
    fn test_postprocessing_serde() {
        let flags: PostProcessing = serde_json::from_str(r#"["clocksync", "MONOTONIZE"]"#).unwrap();
        assert_eq!(flags, PostProcessing::CLOCKSYNC | PostProcessing::MONOTONIZE);
        assert_eq!(
            serde_json::to_string(&flags).unwrap(),
            r#"["clocksync","monotonize"]"#
        );
        assert!(serde_json::from_str::<PostProcessing>(r#"["fast"]"#).is_err());
    }
}
