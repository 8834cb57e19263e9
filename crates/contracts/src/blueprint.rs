//! BridgeBlueprint - Config Loader output
//!
//! Describes a complete bridge session: network, discovery, the two consumed
//! streams, marker code table, the outgoing marker outlet and calibration.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    ChannelFormat, InletConfig, NetworkConfig, OutletConfig, Predicate, ResolverConfig, Result,
    StreamDescriptor, IRREGULAR_RATE,
};

/// Configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// Complete bridge configuration blueprint
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BridgeBlueprint {
    #[serde(default)]
    pub version: ConfigVersion,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Continuous classifier output stream
    #[validate(nested)]
    pub signal: StreamSelector,

    /// Stimulus marker stream
    #[validate(nested)]
    pub markers: StreamSelector,

    #[serde(default)]
    #[validate(nested)]
    pub codes: MarkerCodes,

    #[serde(default)]
    #[validate(nested)]
    pub marker_outlet: MarkerOutletConfig,

    #[serde(default)]
    #[validate(nested)]
    pub calibration: CalibrationConfig,
}

/// Which stream to bind and how to read it
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StreamSelector {
    /// Predicate the stream must satisfy
    pub query: Predicate,

    #[serde(default)]
    pub inlet: InletConfig,

    /// Channel read from multi-channel signal streams
    #[serde(default)]
    #[validate(range(max = 4096))]
    pub channel: usize,
}

impl StreamSelector {
    pub fn new(query: Predicate) -> Self {
        Self {
            query,
            inlet: InletConfig::default(),
            channel: 0,
        }
    }
}

/// Discrete steering class announced by the marker stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteeringClass {
    HoldLeft,
    Rest,
    HoldRight,
    EndOfTrial,
}

impl SteeringClass {
    /// Position in the left / rest / right convention
    pub fn index(self) -> u8 {
        match self {
            SteeringClass::HoldLeft => 0,
            SteeringClass::Rest => 1,
            SteeringClass::HoldRight => 2,
            SteeringClass::EndOfTrial => 3,
        }
    }

    /// Multiplier applied to the continuous signal (`index - 1`)
    pub fn steering_factor(self) -> f64 {
        f64::from(self.index()) - 1.0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SteeringClass::HoldLeft => "hold_left",
            SteeringClass::Rest => "rest",
            SteeringClass::HoldRight => "hold_right",
            SteeringClass::EndOfTrial => "end_of_trial",
        }
    }
}

impl std::fmt::Display for SteeringClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker code bound to a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCode {
    pub code: i32,
    pub class: SteeringClass,
}

impl ClassCode {
    pub const fn new(code: i32, class: SteeringClass) -> Self {
        Self { code, class }
    }
}

/// Incoming marker code table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct MarkerCodes {
    /// Code that moves the session from awaiting-start to running
    #[serde(default = "default_start_code")]
    pub start_code: i32,

    #[serde(default = "default_class_codes")]
    #[validate(length(min = 1))]
    pub classes: Vec<ClassCode>,
}

fn default_start_code() -> i32 {
    1
}

fn default_class_codes() -> Vec<ClassCode> {
    vec![
        ClassCode::new(10, SteeringClass::HoldLeft),
        ClassCode::new(0, SteeringClass::Rest),
        ClassCode::new(11, SteeringClass::HoldRight),
        ClassCode::new(99, SteeringClass::EndOfTrial),
    ]
}

impl Default for MarkerCodes {
    fn default() -> Self {
        Self {
            start_code: default_start_code(),
            classes: default_class_codes(),
        }
    }
}

impl MarkerCodes {
    pub fn class_for(&self, code: i32) -> Option<SteeringClass> {
        self.classes
            .iter()
            .find(|c| c.code == code)
            .map(|c| c.class)
    }

    pub fn code_for(&self, class: SteeringClass) -> Option<i32> {
        self.classes
            .iter()
            .find(|c| c.class == class)
            .map(|c| c.code)
    }
}

/// Outgoing marker stream published by the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct MarkerOutletConfig {
    #[serde(default = "default_outlet_name")]
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default = "default_outlet_type")]
    pub content_type: String,

    #[serde(default = "default_outlet_source_id")]
    pub source_id: String,

    #[serde(default = "default_session_start_code")]
    pub session_start_code: i32,

    #[serde(default = "default_trial_start_code")]
    pub trial_start_code: i32,

    #[serde(default = "default_session_end_code")]
    pub session_end_code: i32,

    /// Per-class cue codes; classes missing here echo their incoming code
    #[serde(default)]
    pub cue_codes: Vec<ClassCode>,

    #[serde(default)]
    pub outlet: OutletConfig,
}

fn default_outlet_name() -> String {
    "MIBridgeMarkers".to_string()
}

fn default_outlet_type() -> String {
    "Markers".to_string()
}

fn default_outlet_source_id() -> String {
    "mibridge-markers".to_string()
}

fn default_session_start_code() -> i32 {
    1
}

fn default_trial_start_code() -> i32 {
    2
}

fn default_session_end_code() -> i32 {
    99
}

impl Default for MarkerOutletConfig {
    fn default() -> Self {
        Self {
            name: default_outlet_name(),
            content_type: default_outlet_type(),
            source_id: default_outlet_source_id(),
            session_start_code: default_session_start_code(),
            trial_start_code: default_trial_start_code(),
            session_end_code: default_session_end_code(),
            cue_codes: Vec::new(),
            outlet: OutletConfig::default(),
        }
    }
}

impl MarkerOutletConfig {
    /// One-channel irregular int32 descriptor for the outgoing markers
    pub fn descriptor(&self) -> Result<StreamDescriptor> {
        StreamDescriptor::new(
            self.name.as_str(),
            self.content_type.as_str(),
            1,
            IRREGULAR_RATE,
            ChannelFormat::Int32,
            self.source_id.as_str(),
        )
    }

    /// Code published for a cue of `class`
    pub fn cue_code(&self, class: SteeringClass, incoming: &MarkerCodes) -> Option<i32> {
        self.cue_codes
            .iter()
            .find(|c| c.class == class)
            .map(|c| c.code)
            .or_else(|| incoming.code_for(class))
    }
}

/// Baseline collection sub-mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CalibrationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Delay between a baseline checkpoint and the resume event (seconds)
    #[serde(default = "default_baseline_delay")]
    #[validate(range(min = 0.0, max = 600.0))]
    pub baseline_delay_secs: f64,
}

fn default_baseline_delay() -> f64 {
    3.0
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            baseline_delay_secs: default_baseline_delay(),
        }
    }
}

/// Runtime settings of an experiment bridge
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub resolver: ResolverConfig,
    pub signal: StreamSelector,
    pub markers: StreamSelector,
    pub codes: MarkerCodes,
    pub marker_outlet: MarkerOutletConfig,
    pub calibration: CalibrationConfig,
}

impl BridgeConfig {
    /// Bridge with default codes and outlet for the two given queries
    pub fn new(signal: Predicate, markers: Predicate) -> Self {
        Self {
            resolver: ResolverConfig::default(),
            signal: StreamSelector::new(signal),
            markers: StreamSelector::new(markers),
            codes: MarkerCodes::default(),
            marker_outlet: MarkerOutletConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl BridgeBlueprint {
    /// Minimal blueprint around two stream queries
    pub fn new(signal: Predicate, markers: Predicate) -> Self {
        Self {
            version: ConfigVersion::V1,
            network: NetworkConfig::default(),
            resolver: ResolverConfig::default(),
            signal: StreamSelector::new(signal),
            markers: StreamSelector::new(markers),
            codes: MarkerCodes::default(),
            marker_outlet: MarkerOutletConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }

    /// Build the bridge's runtime settings (network goes into the stream context)
    pub fn to_bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            resolver: self.resolver.clone(),
            signal: self.signal.clone(),
            markers: self.markers.clone(),
            codes: self.codes.clone(),
            marker_outlet: self.marker_outlet.clone(),
            calibration: self.calibration.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_blueprint() -> BridgeBlueprint {
        BridgeBlueprint::new(
            Predicate::parse("type='MI'").unwrap(),
            Predicate::parse("type='Markers' and name='KartCues'").unwrap(),
        )
    }

    #[test]
    fn test_default_code_table() {
        let codes = MarkerCodes::default();
        assert_eq!(codes.class_for(10), Some(SteeringClass::HoldLeft));
        assert_eq!(codes.class_for(0), Some(SteeringClass::Rest));
        assert_eq!(codes.class_for(11), Some(SteeringClass::HoldRight));
        assert_eq!(codes.class_for(99), Some(SteeringClass::EndOfTrial));
        assert_eq!(codes.class_for(1), None);
    }

    #[test]
    fn test_steering_factors() {
        assert_eq!(SteeringClass::HoldLeft.steering_factor(), -1.0);
        assert_eq!(SteeringClass::Rest.steering_factor(), 0.0);
        assert_eq!(SteeringClass::HoldRight.steering_factor(), 1.0);
    }

    #[test]
    fn test_cue_codes_fall_back_to_incoming() {
        let mut outlet = MarkerOutletConfig::default();
        let codes = MarkerCodes::default();
        assert_eq!(outlet.cue_code(SteeringClass::HoldRight, &codes), Some(11));

        outlet.cue_codes = vec![ClassCode::new(21, SteeringClass::HoldRight)];
        assert_eq!(outlet.cue_code(SteeringClass::HoldRight, &codes), Some(21));
        assert_eq!(outlet.cue_code(SteeringClass::HoldLeft, &codes), Some(10));
    }

    #[test]
    fn test_marker_outlet_descriptor_shape() {
        let desc = MarkerOutletConfig::default().descriptor().unwrap();
        assert_eq!(desc.channel_count(), 1);
        assert!(desc.is_irregular());
        assert_eq!(desc.channel_format(), ChannelFormat::Int32);
        assert!(desc.has_source_id());
    }

    #[test]
    fn test_derive_validation_catches_ranges() {
        let mut blueprint = sample_blueprint();
        assert!(blueprint.validate().is_ok());

        blueprint.calibration.baseline_delay_secs = -1.0;
        assert!(blueprint.validate().is_err());
    }

    #[test]
    fn test_bridge_config_carries_sections() {
        let mut blueprint = sample_blueprint();
        blueprint.calibration.enabled = true;
        let config = blueprint.to_bridge_config();
        assert!(config.calibration.enabled);
        assert_eq!(config.markers.query.as_str(), "type='Markers' and name='KartCues'");
    }
}
