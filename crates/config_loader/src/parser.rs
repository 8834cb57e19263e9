//! Blueprint text formats
//!
//! TOML is what lab configs are written in; JSON is accepted for files
//! produced by other tools.

use std::path::Path;

use contracts::{BridgeBlueprint, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Format of a config file, judged by its extension
    pub fn of_path(path: &Path) -> Result<Self, StreamError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        Self::from_extension(ext).ok_or_else(|| {
            StreamError::config_parse(format!(
                "{}: unsupported config format '.{ext}', expected .toml or .json",
                path.display()
            ))
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Toml => "TOML",
            Self::Json => "JSON",
        }
    }

    /// Deserialize a blueprint; no semantic checks
    pub fn parse(self, content: &str) -> Result<BridgeBlueprint, StreamError> {
        let parsed = match self {
            Self::Toml => toml::from_str(content).map_err(boxed),
            Self::Json => serde_json::from_str(content).map_err(boxed),
        };
        parsed.map_err(|source| StreamError::ConfigParse {
            message: format!("{} parse error: {source}", self.name()),
            source: Some(source),
        })
    }

    pub fn render(self, blueprint: &BridgeBlueprint) -> Result<String, StreamError> {
        let rendered = match self {
            Self::Toml => toml::to_string_pretty(blueprint).map_err(boxed),
            Self::Json => serde_json::to_string_pretty(blueprint).map_err(boxed),
        };
        rendered.map_err(|source| StreamError::ConfigParse {
            message: format!("{} serialize error: {source}", self.name()),
            source: Some(source),
        })
    }
}

fn boxed<E>(e: E) -> Box<dyn std::error::Error + Send + Sync>
where
    E: std::error::Error + Send + Sync + 'static,
{
    Box::new(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::SteeringClass;

    #[test]
    fn test_parse_toml_minimal() {
        let content = r#"
[signal]
query = "type='MI'"

[markers]
query = "name='KartCues'"
"#;
        let bp = ConfigFormat::Toml.parse(content).unwrap();
        assert_eq!(bp.signal.query.as_str(), "type='MI'");
        assert_eq!(bp.codes.start_code, 1);
        assert_eq!(bp.codes.class_for(11), Some(SteeringClass::HoldRight));
        assert_eq!(bp.network.base_port, 16572);
    }

    #[test]
    fn test_parse_json_minimal() {
        let content = r#"{
            "signal": { "query": "type='MI'", "channel": 0 },
            "markers": { "query": "type='Markers'" },
            "codes": {
                "start_code": 5,
                "classes": [
                    { "code": 1, "class": "hold_left" },
                    { "code": 2, "class": "hold_right" }
                ]
            }
        }"#;
        let bp = ConfigFormat::Json.parse(content).unwrap();
        assert_eq!(bp.codes.start_code, 5);
        assert_eq!(bp.codes.class_for(2), Some(SteeringClass::HoldRight));
    }

    #[test]
    fn test_parse_toml_syntax_error() {
        let err = ConfigFormat::Toml.parse("invalid toml [[[").unwrap_err();
        assert!(matches!(err, StreamError::ConfigParse { .. }));
    }

    #[test]
    fn test_malformed_query_is_parse_error() {
        let content = r#"
[signal]
query = "type=="

[markers]
query = "type='Markers'"
"#;
        let err = ConfigFormat::Toml.parse(content).unwrap_err();
        assert!(err.to_string().contains("malformed predicate"), "got: {err}");
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ConfigFormat::from_extension("toml"), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_extension("TOML"), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_extension("json"), Some(ConfigFormat::Json));
        assert_eq!(ConfigFormat::from_extension("yaml"), None);
    }

    #[test]
    fn test_of_path_names_the_file() {
        let format = ConfigFormat::of_path(Path::new("lab/bridge.json")).unwrap();
        assert_eq!(format, ConfigFormat::Json);
        let err = ConfigFormat::of_path(Path::new("lab/bridge")).unwrap_err();
        assert!(err.to_string().contains("lab/bridge: unsupported"), "got: {err}");
    }
}
