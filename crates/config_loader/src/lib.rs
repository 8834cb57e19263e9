//! Loads the bridge blueprint of an experiment.
//!
//! A blueprint file names the classifier and marker streams to bind, the
//! marker code table, the outgoing marker outlet and calibration settings.
//! Loading always runs the semantic checks, so a `BridgeBlueprint` handed out
//! here can be passed straight to the bridge.
//!
//! ```no_run
//! use config_loader::ConfigLoader;
//! use std::path::Path;
//!
//! let blueprint = ConfigLoader::load_from_path(Path::new("bridge.toml"))?;
//! println!("signal query: {}", blueprint.signal.query);
//! # Ok::<(), contracts::StreamError>(())
//! ```

mod parser;
mod validator;

pub use contracts::BridgeBlueprint;
pub use parser::ConfigFormat;

use contracts::StreamError;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Read, parse and check a `.toml` or `.json` blueprint.
    ///
    /// Parse errors are prefixed with the file path.
    pub fn load_from_path(path: &Path) -> Result<BridgeBlueprint, StreamError> {
        let format = ConfigFormat::of_path(path)?;
        let content = std::fs::read_to_string(path)?;
        let blueprint = format.parse(&content).map_err(|e| match e {
            StreamError::ConfigParse { message, source } => StreamError::ConfigParse {
                message: format!("{}: {message}", path.display()),
                source,
            },
            other => other,
        })?;
        Self::validate(&blueprint)?;
        Ok(blueprint)
    }

    pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<BridgeBlueprint, StreamError> {
        let blueprint = format.parse(content)?;
        Self::validate(&blueprint)?;
        Ok(blueprint)
    }

    /// Semantic checks, for blueprints built or edited in code
    pub fn validate(blueprint: &BridgeBlueprint) -> Result<(), StreamError> {
        validator::validate(blueprint)
    }

    pub fn to_toml(blueprint: &BridgeBlueprint) -> Result<String, StreamError> {
        ConfigFormat::Toml.render(blueprint)
    }

    pub fn to_json(blueprint: &BridgeBlueprint) -> Result<String, StreamError> {
        ConfigFormat::Json.render(blueprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::SteeringClass;
    use std::io::Write;

    const LAB_TOML: &str = r#"
[network]
base_port = 16571
port_range = 8
known_peers = ["127.0.0.1"]

[resolver]
probe_interval_ms = 100
forget_after_secs = 3.0

[signal]
query = "type='MI' and name='Classifier'"
channel = 0

[markers]
query = "type='Markers' and name='KartCues'"

[markers.inlet]
recover = false

[codes]
start_code = 1

[[codes.classes]]
code = 10
class = "hold_left"

[[codes.classes]]
code = 0
class = "rest"

[[codes.classes]]
code = 11
class = "hold_right"

[[codes.classes]]
code = 99
class = "end_of_trial"

[marker_outlet]
name = "KartEvents"

[calibration]
enabled = true
baseline_delay_secs = 2.5
"#;

    #[test]
    fn test_load_from_str_toml() {
        let result = ConfigLoader::load_from_str(LAB_TOML, ConfigFormat::Toml);
        assert!(result.is_ok(), "Failed: {:?}", result.err());
        let bp = result.unwrap();
        assert_eq!(bp.network.base_port, 16571);
        assert!(!bp.markers.inlet.recover);
        assert_eq!(bp.codes.class_for(11), Some(SteeringClass::HoldRight));
        assert_eq!(bp.marker_outlet.name, "KartEvents");
        assert!(bp.calibration.enabled);
    }

    #[test]
    fn test_round_trip_toml() {
        let bp = ConfigLoader::load_from_str(LAB_TOML, ConfigFormat::Toml).unwrap();
        let serialized = ConfigLoader::to_toml(&bp).unwrap();
        let bp2 = ConfigLoader::load_from_str(&serialized, ConfigFormat::Toml).unwrap();
        assert_eq!(bp.signal.query, bp2.signal.query);
        assert_eq!(bp.codes, bp2.codes);
        assert_eq!(bp.network, bp2.network);
    }

    #[test]
    fn test_round_trip_json() {
        let bp = ConfigLoader::load_from_str(LAB_TOML, ConfigFormat::Toml).unwrap();
        let json = ConfigLoader::to_json(&bp).unwrap();
        let bp2 = ConfigLoader::load_from_str(&json, ConfigFormat::Json).unwrap();
        assert_eq!(bp.markers.query, bp2.markers.query);
        assert_eq!(bp.calibration, bp2.calibration);
    }

    #[test]
    fn test_validation_runs_after_parse() {
        let content = r#"
[signal]
query = "type='MI'"

[markers]
query = "type='Markers'"

[[codes.classes]]
code = 10
class = "hold_left"

[[codes.classes]]
code = 10
class = "hold_right"
"#;
        let result = ConfigLoader::load_from_str(content, ConfigFormat::Toml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_load_from_path_detects_format() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(LAB_TOML.as_bytes()).unwrap();
        let bp = ConfigLoader::load_from_path(file.path()).unwrap();
        assert_eq!(bp.resolver.probe_interval_ms, 100);
    }

    #[test]
    fn test_load_from_path_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let err = ConfigLoader::load_from_path(file.path()).unwrap_err();
        assert!(err.to_string().contains("unsupported config format '.yaml'"), "got: {err}");
    }

    #[test]
    fn test_parse_error_names_the_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(b"[signal\nquery = ").unwrap();
        let err = ConfigLoader::load_from_path(file.path()).unwrap_err();
        assert!(matches!(err, StreamError::ConfigParse { .. }));
        let text = err.to_string();
        assert!(text.contains(&file.path().display().to_string()), "got: {text}");
        assert!(text.contains("TOML parse error"), "got: {text}");
    }

    #[test]
    fn test_load_from_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::load_from_path(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }
}
