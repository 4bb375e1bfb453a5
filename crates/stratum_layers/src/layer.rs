//! # Layer Definitions
//!
//! Plain data records describing where and how strongly a set of assets and
//! effects should be active. Created from authored configuration and
//! immutable once the catalog is frozen.
//!
//! ```toml
//! [[layer]]
//! id = "forest"
//! mask = "masks/biomes.png"
//! channel = "g"
//! priority = 10
//! blend = "override"
//! threshold = 0.2
//!
//! [[layer.asset]]
//! reference = "/Game/Foliage/Pine"
//! kind = "static_mesh"
//!
//! [[layer.effect]]
//! template = "/Game/FX/Fireflies"
//!
//! [[layer.effect.parameter]]
//! name = "Density"
//! scale = 2.0
//! ```

use std::borrow::Borrow;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use stratum_mask::Channel;

/// Unique layer identifier. Orders lexicographically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(String);

impl LayerId {
    /// Creates an identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for LayerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LayerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for LayerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Reference to an external asset or effect template (name or path).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetRef(String);

impl AssetRef {
    /// Creates a reference.
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Reference text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// How a layer combines with lower-priority layers on the same output channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    /// Replace lower contributions.
    #[default]
    Override,
    /// Add to the accumulator, clamped to 1.
    Additive,
    /// Scale the accumulator.
    Multiply,
}

/// Kind of an external asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    /// Static mesh (foliage, props).
    StaticMesh,
    /// Skeletal mesh.
    SkeletalMesh,
    /// Material.
    Material,
    /// Texture.
    Texture,
    /// Sound.
    Sound,
    /// Particle / effect template.
    Effect,
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StaticMesh => "static_mesh",
            Self::SkeletalMesh => "skeletal_mesh",
            Self::Material => "material",
            Self::Texture => "texture",
            Self::Sound => "sound",
            Self::Effect => "effect",
        };
        f.write_str(name)
    }
}

/// Asset streamed in while the layer is loaded in a cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBinding {
    /// Registry reference.
    pub reference: AssetRef,
    /// Kind the registry must report for this reference.
    pub kind: AssetKind,
}

impl AssetBinding {
    /// Creates a binding.
    #[must_use]
    pub fn new(reference: impl Into<String>, kind: AssetKind) -> Self {
        Self {
            reference: AssetRef::new(reference),
            kind,
        }
    }
}

/// `value = offset + scale * weight(source)` pushed into a named effect parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterMapping {
    /// Effect parameter name.
    pub name: String,
    /// Layer whose composited weight feeds the parameter. Defaults to the owning layer.
    #[serde(default)]
    pub source: Option<LayerId>,
    /// Multiplier on the weight.
    #[serde(default = "default_scale")]
    pub scale: f32,
    /// Constant added after scaling.
    #[serde(default)]
    pub offset: f32,
}

fn default_scale() -> f32 {
    1.0
}

impl ParameterMapping {
    /// Maps the owning layer's weight straight into `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            scale: 1.0,
            offset: 0.0,
        }
    }

    /// Reads another layer's weight.
    #[must_use]
    pub fn from_layer(mut self, source: impl Into<LayerId>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets scale and offset.
    #[must_use]
    pub fn scaled(mut self, scale: f32, offset: f32) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    /// Parameter value for a given source weight.
    #[inline]
    #[must_use]
    pub fn apply(&self, weight: f32) -> f32 {
        self.offset + self.scale * weight
    }
}

/// Effect template spawned while the layer is loaded in a cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffectBinding {
    /// Effect template reference.
    pub template: AssetRef,
    /// Extra parameters beyond the implicit weight.
    #[serde(default, rename = "parameter")]
    pub parameters: Vec<ParameterMapping>,
}

impl EffectBinding {
    /// Creates a binding with no extra parameters.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: AssetRef::new(template),
            parameters: Vec::new(),
        }
    }

    /// Adds a parameter mapping.
    #[must_use]
    pub fn with_parameter(mut self, mapping: ParameterMapping) -> Self {
        self.parameters.push(mapping);
        self
    }
}

/// A named rule set: mask, priority, blend mode and bindings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerDefinition {
    /// Unique identifier.
    pub id: LayerId,
    /// Mask source path.
    pub mask: PathBuf,
    /// Mask channel holding this layer's weight.
    #[serde(default)]
    pub channel: Channel,
    /// Output channel this layer blends into. Defaults to the layer identifier.
    #[serde(default)]
    pub output: Option<String>,
    /// Higher wins.
    #[serde(default)]
    pub priority: i32,
    /// Blend against lower-priority layers on the same output channel.
    #[serde(default)]
    pub blend: BlendMode,
    /// Minimum weight to count as active.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Assets streamed while loaded.
    #[serde(default, rename = "asset")]
    pub assets: Vec<AssetBinding>,
    /// Effects spawned while loaded.
    #[serde(default, rename = "effect")]
    pub effects: Vec<EffectBinding>,
}

fn default_threshold() -> f32 {
    0.5
}

impl LayerDefinition {
    /// Layer reading channel R of `mask`, priority 0, Override, threshold 0.5.
    #[must_use]
    pub fn new(id: impl Into<LayerId>, mask: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            mask: mask.into(),
            channel: Channel::R,
            output: None,
            priority: 0,
            blend: BlendMode::Override,
            threshold: default_threshold(),
            assets: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the blend mode.
    #[must_use]
    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    /// Sets the activation threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Sets the mask channel.
    #[must_use]
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Blends into a shared output channel.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Adds an asset binding.
    #[must_use]
    pub fn with_asset(mut self, binding: AssetBinding) -> Self {
        self.assets.push(binding);
        self
    }

    /// Adds an effect binding.
    #[must_use]
    pub fn with_effect(mut self, binding: EffectBinding) -> Self {
        self.effects.push(binding);
        self
    }

    /// Output channel name.
    #[must_use]
    pub fn output_channel(&self) -> &str {
        self.output.as_deref().unwrap_or(self.id.as_str())
    }
}
