//! Blueprint validation
//!
//! Rules:
//! - field ranges declared on the blueprint types (`validator` derive)
//! - network, resolver, inlet and outlet settings pass their own checks
//! - signal and marker queries are not empty
//! - incoming class codes are unique, each class is bound once
//! - start code is distinct from every class code
//! - outgoing session start / trial start / end codes are distinct
//! - resolver probe interval <= forget window

use std::collections::HashSet;

use contracts::{BridgeBlueprint, StreamError};
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// Validate a parsed blueprint.
///
/// Returns the first error encountered.
pub fn validate(blueprint: &BridgeBlueprint) -> Result<(), StreamError> {
    blueprint.validate().map_err(|e| first_field_error("", &e))?;
    validate_endpoints(blueprint)?;
    validate_queries(blueprint)?;
    validate_class_codes(blueprint)?;
    validate_outgoing_codes(blueprint)?;
    validate_resolver_window(blueprint)?;
    Ok(())
}

/// Flatten nested derive errors into the first offending field path
fn first_field_error(prefix: &str, errors: &ValidationErrors) -> StreamError {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(list) => {
                let message = list
                    .first()
                    .map(|e| match &e.message {
                        Some(message) => message.to_string(),
                        None => format!("failed '{}' check", e.code),
                    })
                    .unwrap_or_else(|| "invalid value".to_string());
                return StreamError::config_validation(path, message);
            }
            ValidationErrorsKind::Struct(inner) => return first_field_error(&path, inner),
            ValidationErrorsKind::List(items) => {
                if let Some((index, inner)) = items.iter().next() {
                    return first_field_error(&format!("{path}[{index}]"), inner);
                }
            }
        }
    }
    StreamError::config_validation(prefix, "invalid value")
}

fn validate_endpoints(blueprint: &BridgeBlueprint) -> Result<(), StreamError> {
    blueprint.network.validate()?;
    blueprint.resolver.validate()?;
    blueprint.signal.inlet.validate()?;
    blueprint.markers.inlet.validate()?;
    blueprint.marker_outlet.outlet.validate()?;
    Ok(())
}

fn validate_queries(blueprint: &BridgeBlueprint) -> Result<(), StreamError> {
    for (field, selector) in [("signal.query", &blueprint.signal), ("markers.query", &blueprint.markers)] {
        if selector.query.as_str().is_empty() {
            return Err(StreamError::config_validation(
                field,
                "stream query cannot be empty",
            ));
        }
    }
    if blueprint.marker_outlet.content_type.trim().is_empty() {
        return Err(StreamError::config_validation(
            "marker_outlet.content_type",
            "content type cannot be empty",
        ));
    }
    Ok(())
}

fn validate_class_codes(blueprint: &BridgeBlueprint) -> Result<(), StreamError> {
    let codes = &blueprint.codes;
    let mut seen_codes = HashSet::new();
    let mut seen_classes = HashSet::new();
    for (idx, entry) in codes.classes.iter().enumerate() {
        if !seen_codes.insert(entry.code) {
            return Err(StreamError::config_validation(
                format!("codes.classes[{idx}].code"),
                format!("duplicate marker code {}", entry.code),
            ));
        }
        if !seen_classes.insert(entry.class) {
            return Err(StreamError::config_validation(
                format!("codes.classes[{idx}].class"),
                format!("duplicate class {}", entry.class),
            ));
        }
    }
    if seen_codes.contains(&codes.start_code) {
        return Err(StreamError::config_validation(
            "codes.start_code",
            format!("start code {} is also a class code", codes.start_code),
        ));
    }
    Ok(())
}

fn validate_outgoing_codes(blueprint: &BridgeBlueprint) -> Result<(), StreamError> {
    let outlet = &blueprint.marker_outlet;
    let session_codes = [
        outlet.session_start_code,
        outlet.trial_start_code,
        outlet.session_end_code,
    ];
    let distinct: HashSet<_> = session_codes.iter().collect();
    if distinct.len() != session_codes.len() {
        return Err(StreamError::config_validation(
            "marker_outlet",
            format!(
                "session_start_code ({}), trial_start_code ({}) and session_end_code ({}) must differ",
                outlet.session_start_code, outlet.trial_start_code, outlet.session_end_code
            ),
        ));
    }
    Ok(())
}

fn validate_resolver_window(blueprint: &BridgeBlueprint) -> Result<(), StreamError> {
    let resolver = &blueprint.resolver;
    if resolver.probe_interval() > resolver.forget_after() {
        return Err(StreamError::config_validation(
            "resolver.probe_interval_ms / resolver.forget_after_secs",
            format!(
                "probe_interval_ms ({}) must be <= forget_after_secs ({}s)",
                resolver.probe_interval_ms, resolver.forget_after_secs
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{ClassCode, Predicate, SteeringClass};

    fn minimal_blueprint() -> BridgeBlueprint {
        BridgeBlueprint::new(
            Predicate::parse("type='MI'").unwrap(),
            Predicate::parse("name='KartCues'").unwrap(),
        )
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&minimal_blueprint()).is_ok());
    }

    #[test]
    fn test_duplicate_class_code() {
        let mut bp = minimal_blueprint();
        bp.codes
            .classes
            .push(ClassCode::new(10, SteeringClass::Rest));
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("duplicate marker code 10"), "got: {err}");
    }

    #[test]
    fn test_duplicate_class() {
        let mut bp = minimal_blueprint();
        bp.codes
            .classes
            .push(ClassCode::new(42, SteeringClass::HoldLeft));
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("duplicate class hold_left"), "got: {err}");
    }

    #[test]
    fn test_start_code_clashes_with_class() {
        let mut bp = minimal_blueprint();
        bp.codes.start_code = 11;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("codes.start_code"), "got: {err}");
    }

    #[test]
    fn test_empty_query() {
        let mut bp = minimal_blueprint();
        bp.markers.query = Predicate::any();
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("markers.query"), "got: {err}");
    }

    #[test]
    fn test_empty_outlet_name_caught_by_derive() {
        let mut bp = minimal_blueprint();
        bp.marker_outlet.name = String::new();
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("marker_outlet.name"), "got: {err}");
    }

    #[test]
    fn test_baseline_delay_range() {
        let mut bp = minimal_blueprint();
        bp.calibration.baseline_delay_secs = 1000.0;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("calibration.baseline_delay_secs"), "got: {err}");
    }

    #[test]
    fn test_outgoing_codes_distinct() {
        let mut bp = minimal_blueprint();
        bp.marker_outlet.trial_start_code = bp.marker_outlet.session_end_code;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("must differ"), "got: {err}");
    }

    #[test]
    fn test_probe_interval_exceeds_forget_window() {
        let mut bp = minimal_blueprint();
        bp.resolver.probe_interval_ms = 5000;
        bp.resolver.forget_after_secs = 2.0;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("probe_interval_ms"), "got: {err}");
    }

    #[test]
    fn test_invalid_inlet_buffer() {
        let mut bp = minimal_blueprint();
        bp.signal.inlet.max_buffered = 0.0;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("inlet.max_buffered"), "got: {err}");
    }
}
