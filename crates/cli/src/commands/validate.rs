//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{BridgeBlueprint, SteeringClass};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    signal_query: String,
    marker_query: String,
    class_codes: usize,
    outlet: String,
    calibration: bool,
}

pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result).context("encoding result")?);
    } else {
        print_validation_result(&result);
    }

    anyhow::ensure!(result.valid, "{} failed validation", result.config_path);
    Ok(())
}

impl ValidationResult {
    fn failed(config_path: String, error: impl ToString) -> Self {
        Self {
            valid: false,
            config_path,
            error: Some(error.to_string()),
            warnings: None,
            summary: None,
        }
    }
}

impl From<&BridgeBlueprint> for ConfigSummary {
    fn from(blueprint: &BridgeBlueprint) -> Self {
        Self {
            version: format!("{:?}", blueprint.version),
            signal_query: blueprint.signal.query.to_string(),
            marker_query: blueprint.markers.query.to_string(),
            class_codes: blueprint.codes.classes.len(),
            outlet: blueprint.marker_outlet.name.clone(),
            calibration: blueprint.calibration.enabled,
        }
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();
    if !args.config.exists() {
        let error = format!("File not found: {config_path}");
        return ValidationResult::failed(config_path, error);
    }

    let blueprint = match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(blueprint) => blueprint,
        Err(e) => return ValidationResult::failed(config_path, e),
    };
    let warnings = collect_warnings(&blueprint);
    ValidationResult {
        valid: true,
        config_path,
        error: None,
        warnings: (!warnings.is_empty()).then_some(warnings),
        summary: Some(ConfigSummary::from(&blueprint)),
    }
}

/// Non-fatal issues
fn collect_warnings(blueprint: &BridgeBlueprint) -> Vec<String> {
    let mut warnings = Vec::new();

    for class in [
        SteeringClass::HoldLeft,
        SteeringClass::Rest,
        SteeringClass::HoldRight,
        SteeringClass::EndOfTrial,
    ] {
        if blueprint.codes.code_for(class).is_none() {
            warnings.push(format!("No marker code bound to class '{class}'"));
        }
    }

    if blueprint.signal.query == blueprint.markers.query {
        warnings.push("signal and marker queries are identical".to_string());
    }

    if !blueprint.markers.inlet.recover {
        warnings.push(
            "markers.inlet.recover is off - a restarted marker source ends the binding".to_string(),
        );
    }

    if blueprint.calibration.enabled && blueprint.calibration.baseline_delay_secs == 0.0 {
        warnings.push("calibration enabled with a zero baseline delay".to_string());
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if !result.valid {
        println!("✗ {} is invalid", result.config_path);
        if let Some(error) = &result.error {
            println!("    {error}");
        }
        return;
    }

    println!("✓ {} is valid", result.config_path);
    if let Some(summary) = &result.summary {
        println!("    version       {}", summary.version);
        println!("    signal        {}", summary.signal_query);
        println!("    markers       {}", summary.marker_query);
        println!("    class codes   {}", summary.class_codes);
        println!("    marker outlet {}", summary.outlet);
        println!("    calibration   {}", summary.calibration);
    }
    for warning in result.warnings.iter().flatten() {
        println!("  ⚠ {warning}");
    }
}
