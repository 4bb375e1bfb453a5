//! # Layer Registry Validator
//!
//! CI gate run before packaging: every asset and effect a layer references
//! must exist in the asset manifest with the right kind.
//!
//! ```bash
//! validate_layers layers.toml assets.toml
//! RUST_LOG=debug validate_layers layers.toml assets.toml
//! ```
//!
//! Exit codes: 0 clean, 1 issues found, 2 bad input.

use std::process::ExitCode;

use stratum::layers::{InMemoryRegistry, LayerCatalog, ValidationReport, WorldLayersConfig};
use tracing::error;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: validate_layers <layers.toml> <assets.toml>";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [config_path, manifest_path] = args.as_slice() else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    let config = match WorldLayersConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path, error = %e, "Cannot load layer configuration");
            return ExitCode::from(2);
        }
    };
    let catalog = match LayerCatalog::from_config(&config) {
        Ok(catalog) => catalog,
        Err(e) => {
            error!(error = %e, "Layer configuration is inconsistent");
            return ExitCode::from(2);
        }
    };
    let registry = match InMemoryRegistry::load(manifest_path) {
        Ok(registry) => registry,
        Err(e) => {
            error!(path = %manifest_path, error = %e, "Cannot load asset manifest");
            return ExitCode::from(2);
        }
    };

    let report = ValidationReport::run(&catalog, &registry);
    print!("{report}");
    if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
