//! # Registry Validator
//!
//! Offline check that every reference in the catalog resolves in the asset
//! registry with the expected kind. Runs in CI before packaging; never at
//! runtime and never mutates the catalog.

use std::fmt;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::catalog::LayerCatalog;
use crate::layer::{AssetKind, AssetRef, LayerId};
use crate::registry::AssetRegistry;

/// One problem found in the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationIssue {
    /// The registry does not know the reference.
    MissingAsset {
        /// Layer holding the binding.
        layer: LayerId,
        /// Unresolved reference.
        reference: AssetRef,
    },
    /// The reference exists with another kind.
    TypeMismatch {
        /// Layer holding the binding.
        layer: LayerId,
        /// Reference.
        reference: AssetRef,
        /// Kind the binding expects.
        expected: AssetKind,
        /// Kind the registry reports.
        actual: AssetKind,
    },
    /// The layer's mask has no registered source.
    UnknownMask {
        /// Layer.
        layer: LayerId,
        /// Mask path.
        mask: PathBuf,
    },
    /// A parameter mapping reads a layer missing from the catalog.
    UnknownParameterSource {
        /// Layer holding the mapping.
        layer: LayerId,
        /// Parameter name.
        parameter: String,
        /// Missing source layer.
        source: LayerId,
    },
}

impl ValidationIssue {
    /// Short kind label used to group issues.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingAsset { .. } => "MissingAsset",
            Self::TypeMismatch { .. } => "TypeMismatch",
            Self::UnknownMask { .. } => "UnknownMask",
            Self::UnknownParameterSource { .. } => "UnknownParameterSource",
        }
    }

    /// Layer the issue belongs to.
    #[must_use]
    pub const fn layer(&self) -> &LayerId {
        match self {
            Self::MissingAsset { layer, .. }
            | Self::TypeMismatch { layer, .. }
            | Self::UnknownMask { layer, .. }
            | Self::UnknownParameterSource { layer, .. } => layer,
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingAsset { layer, reference } => {
                write!(f, "layer '{layer}': asset '{reference}' not found in registry")
            }
            Self::TypeMismatch {
                layer,
                reference,
                expected,
                actual,
            } => write!(f, "layer '{layer}': '{reference}' is a {actual}, expected {expected}"),
            Self::UnknownMask { layer, mask } => {
                write!(f, "layer '{layer}': mask '{}' has no registered source", mask.display())
            }
            Self::UnknownParameterSource {
                layer,
                parameter,
                source,
            } => write!(f, "layer '{layer}': parameter '{parameter}' reads unknown layer '{source}'"),
        }
    }
}

/// Checks every binding of every layer. Issues come in catalog order.
#[must_use]
pub fn validate(catalog: &LayerCatalog, registry: &dyn AssetRegistry) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut check = |layer: &LayerId, reference: &AssetRef, expected: AssetKind| match registry.resolve(reference) {
        None => issues.push(ValidationIssue::MissingAsset {
            layer: layer.clone(),
            reference: reference.clone(),
        }),
        Some(found) if found.kind != expected => issues.push(ValidationIssue::TypeMismatch {
            layer: layer.clone(),
            reference: reference.clone(),
            expected,
            actual: found.kind,
        }),
        Some(_) => {}
    };

    for layer in catalog.iter() {
        for asset in &layer.assets {
            check(&layer.id, &asset.reference, asset.kind);
        }
        for effect in &layer.effects {
            check(&layer.id, &effect.template, AssetKind::Effect);
        }
    }

    for layer in catalog.iter() {
        if !catalog.has_mask(&layer.mask) {
            issues.push(ValidationIssue::UnknownMask {
                layer: layer.id.clone(),
                mask: layer.mask.clone(),
            });
        }
        for mapping in layer.effects.iter().flat_map(|e| &e.parameters) {
            if let Some(source) = &mapping.source {
                if catalog.get(source).is_none() {
                    issues.push(ValidationIssue::UnknownParameterSource {
                        layer: layer.id.clone(),
                        parameter: mapping.name.clone(),
                        source: source.clone(),
                    });
                }
            }
        }
    }
    issues
}

/// Outcome of a validation run with a printable summary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Layers inspected.
    pub layers_checked: usize,
    /// Asset and effect references inspected.
    pub references_checked: usize,
    /// Problems found.
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Validates `catalog` against `registry` and logs the outcome.
    #[must_use]
    pub fn run(catalog: &LayerCatalog, registry: &dyn AssetRegistry) -> Self {
        let report = Self {
            layers_checked: catalog.len(),
            references_checked: catalog.iter().map(|l| l.assets.len() + l.effects.len()).sum(),
            issues: validate(catalog, registry),
        };
        if report.is_clean() {
            info!(layers = report.layers_checked, references = report.references_checked, "Layer catalog valid");
        } else {
            for issue in &report.issues {
                warn!(kind = issue.kind(), layer = %issue.layer(), "{issue}");
            }
        }
        report
    }

    /// True if nothing was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Issues of one kind label.
    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a ValidationIssue> + 'a {
        self.issues.iter().filter(move |i| i.kind() == kind)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "checked {} layers, {} references: {} issue(s)",
            self.layers_checked,
            self.references_checked,
            self.issues.len()
        )?;
        for kind in ["MissingAsset", "TypeMismatch", "UnknownMask", "UnknownParameterSource"] {
            let group: Vec<_> = self.of_kind(kind).collect();
            if group.is_empty() {
                continue;
            }
            writeln!(f, "{kind} ({}):", group.len())?;
            for issue in group {
                writeln!(f, "  - {issue}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{AssetBinding, EffectBinding, LayerDefinition, ParameterMapping};
    use crate::registry::InMemoryRegistry;
    use stratum_shared::Bounds2;

    fn registry() -> InMemoryRegistry {
        let mut r = InMemoryRegistry::new();
        r.insert("/Game/Pine", AssetKind::StaticMesh);
        r.insert("/Game/FX/Mist", AssetKind::Effect);
        r
    }

    #[test]
    fn test_clean_catalog() {
        let mut c = LayerCatalog::new();
        c.register_mask_bounds("m.png", Bounds2::default()).unwrap();
        c.add_layer(
            LayerDefinition::new("forest", "m.png")
                .with_asset(AssetBinding::new("/Game/Pine", AssetKind::StaticMesh))
                .with_effect(EffectBinding::new("/Game/FX/Mist")),
        )
        .unwrap();
        let report = ValidationReport::run(&c, &registry());
        assert!(report.is_clean());
        assert_eq!(report.references_checked, 2);
    }

    #[test]
    fn test_all_issue_kinds() {
        let mut c = LayerCatalog::new();
        c.register_mask_bounds("m.png", Bounds2::default()).unwrap();
        c.add_layer(
            LayerDefinition::new("a", "m.png")
                .with_asset(AssetBinding::new("/Game/Oak", AssetKind::StaticMesh))
                .with_asset(AssetBinding::new("/Game/FX/Mist", AssetKind::StaticMesh)),
        )
        .unwrap();
        c.add_layer(
            LayerDefinition::new("b", "missing.png")
                .with_effect(EffectBinding::new("/Game/Pine").with_parameter(ParameterMapping::new("X").from_layer("zzz"))),
        )
        .unwrap();

        let issues = validate(&c, &registry());
        let kinds: Vec<_> = issues.iter().map(ValidationIssue::kind).collect();
        assert_eq!(
            kinds,
            ["MissingAsset", "TypeMismatch", "TypeMismatch", "UnknownMask", "UnknownParameterSource"]
        );
        assert_eq!(
            issues[2],
            ValidationIssue::TypeMismatch {
                layer: "b".into(),
                reference: AssetRef::new("/Game/Pine"),
                expected: AssetKind::Effect,
                actual: AssetKind::StaticMesh,
            }
        );

        let text = ValidationReport::run(&c, &registry()).to_string();
        assert!(text.contains("5 issue(s)"));
        assert!(text.contains("TypeMismatch (2):"));
    }
}
