//! # Authored Configuration
//!
//! One TOML document describes the whole layer set:
//!
//! ```toml
//! [streaming]
//! cell_size = 64.0
//! activate_debounce_ms = 250
//!
//! [effects]
//! weight_parameter = "Weight"
//!
//! [mask_cache]
//! max_entries = 64
//!
//! [[mask]]
//! path = "masks/biomes.png"
//! world_size = [1024.0, 1024.0]
//!
//! [[layer]]
//! id = "forest"
//! mask = "masks/biomes.png"
//! ```
//!
//! Layer order in the file does not matter; the catalog sorts by priority.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use stratum_mask::{MaskCacheConfig, MaskSource};
use tracing::info;

use crate::effects::EffectsConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::layer::LayerDefinition;
use crate::streaming::StreamingConfig;

/// The complete authored layer set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldLayersConfig {
    /// Streaming controller tunables.
    pub streaming: StreamingConfig,
    /// Effect driver tunables.
    pub effects: EffectsConfig,
    /// Mask cache bounds.
    pub mask_cache: MaskCacheConfig,
    /// Mask sources.
    #[serde(rename = "mask")]
    pub masks: Vec<MaskSource>,
    /// Layer definitions.
    #[serde(rename = "layer")]
    pub layers: Vec<LayerDefinition>,
}

impl WorldLayersConfig {
    /// Parses a TOML document and checks its tunables.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML, otherwise as
    /// [`WorldLayersConfig::validate`].
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`WorldLayersConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        info!(
            path = %path.display(),
            masks = config.masks.len(),
            layers = config.layers.len(),
            "Loaded layer configuration"
        );
        Ok(config)
    }

    /// Checks tunables and mask placements.
    ///
    /// Layer-level problems (duplicates, thresholds) are reported by the
    /// catalog when it is built.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidSetting`] or [`ConfigError::Mask`].
    pub fn validate(&self) -> ConfigResult<()> {
        self.streaming.validate()?;
        if self.effects.weight_parameter.is_empty() {
            return Err(ConfigError::InvalidSetting {
                setting: "effects.weight_parameter",
                reason: "must not be empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for source in &self.masks {
            source.validate()?;
            if !seen.insert(source.path.as_path()) {
                return Err(ConfigError::InvalidSetting {
                    setting: "mask.path",
                    reason: format!("{} is declared twice", source.path.display()),
                });
            }
        }
        Ok(())
    }

    /// Serialises back to TOML.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidSetting`] if a value cannot be represented.
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidSetting {
            setting: "config",
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::BlendMode;
    use std::time::Duration;

    const DOC: &str = r#"
        [streaming]
        cell_size = 32.0
        activate_debounce_ms = 100
        deactivate_debounce_ms = 400

        [[mask]]
        path = "a.png"
        origin = [-50.0, -50.0]
        world_size = [100.0, 100.0]

        [[layer]]
        id = "low"
        mask = "a.png"
        priority = 1
        blend = "multiply"
        threshold = 0.1

        [[layer]]
        id = "high"
        mask = "a.png"
        priority = 9
    "#;

    #[test]
    fn test_parse_document() {
        let config = WorldLayersConfig::from_toml_str(DOC).unwrap();
        assert_eq!(config.streaming.cell_size, 32.0);
        assert_eq!(config.streaming.activate_debounce(), Duration::from_millis(100));
        assert_eq!(config.streaming.max_retries, StreamingConfig::default().max_retries);
        assert_eq!(config.effects.weight_parameter, "Weight");
        assert_eq!(config.masks.len(), 1);
        assert_eq!(config.layers[0].blend, BlendMode::Multiply);
    }

    #[test]
    fn test_parse_mask_without_image() {
        let doc = format!(
            "{DOC}\n[[mask]]\npath = \"flat\"\nworld_size = [8.0, 8.0]\nblank = true\ndefault_value = [0.25, 0.0, 0.0, 0.0]\n"
        );
        let config = WorldLayersConfig::from_toml_str(&doc).unwrap();
        let flat = &config.masks[1];
        assert!(flat.blank);
        assert_eq!(flat.default_value, [0.25, 0.0, 0.0, 0.0]);
        assert!(!config.masks[0].blank);
        assert_eq!(config.masks[0].default_value, [0.0; 4]);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = WorldLayersConfig::from_toml_str("").unwrap();
        assert_eq!(config, WorldLayersConfig::default());
    }

    #[test]
    fn test_duplicate_mask_rejected() {
        let doc = format!("{DOC}\n[[mask]]\npath = \"a.png\"\nworld_size = [1.0, 1.0]\n");
        assert!(matches!(
            WorldLayersConfig::from_toml_str(&doc),
            Err(ConfigError::InvalidSetting { setting: "mask.path", .. })
        ));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = WorldLayersConfig::from_toml_str(DOC).unwrap();
        let text = config.to_toml_string().unwrap();
        assert_eq!(WorldLayersConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = WorldLayersConfig::load("/no/such/layers.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
