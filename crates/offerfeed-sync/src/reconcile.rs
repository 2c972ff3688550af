//! Priority fallback across attribute sources.

use std::collections::HashSet;
use std::sync::Arc;

use offerfeed_adapters::AttributeSource;
use offerfeed_core::{normalize_identity_part, AttributeKey, BaseVariant, Resolved, Variant, VariantKey};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RequiredAttribute {
    Present(AttributeKey),
    AnyOf(Vec<AttributeKey>),
}

impl RequiredAttribute {
    fn satisfied_by(&self, variant: &Variant) -> bool {
        match self {
            RequiredAttribute::Present(key) => variant.value(*key).is_some(),
            RequiredAttribute::AnyOf(keys) => keys.iter().any(|k| variant.value(*k).is_some()),
        }
    }

    fn label(&self) -> String {
        match self {
            RequiredAttribute::Present(key) => key.to_string(),
            RequiredAttribute::AnyOf(keys) => keys
                .iter()
                .map(AttributeKey::as_str)
                .collect::<Vec<_>>()
                .join("|"),
        }
    }
}

pub fn default_required() -> Vec<RequiredAttribute> {
    vec![
        RequiredAttribute::Present(AttributeKey::Link),
        RequiredAttribute::Present(AttributeKey::Image),
        RequiredAttribute::AnyOf(vec![AttributeKey::Price, AttributeKey::Installment]),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    pub key: VariantKey,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileOutcome {
    pub variants: Vec<Variant>,
    pub exclusions: Vec<Exclusion>,
}

impl ReconcileOutcome {
    pub fn extend(&mut self, other: ReconcileOutcome) {
        self.variants.extend(other.variants);
        self.exclusions.extend(other.exclusions);
    }
}

pub struct Reconciler {
    sources: Vec<Arc<dyn AttributeSource>>,
    required: Vec<RequiredAttribute>,
}

impl Reconciler {
    /// Sources are consulted by rank; equal ranks keep their given order.
    pub fn new(mut sources: Vec<Arc<dyn AttributeSource>>) -> Self {
        sources.sort_by_key(|s| s.rank());
        Self {
            sources,
            required: default_required(),
        }
    }

    pub fn with_required(mut self, required: Vec<RequiredAttribute>) -> Self {
        self.required = required;
        self
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.source_id()).collect()
    }

    /// One variant per exterior color of `base`, or a single colorless variant when no source knows any.
    pub fn reconcile(&self, base: &BaseVariant) -> ReconcileOutcome {
        let (colors, color_source) = self.fan_out_colors(base);
        let mut outcome = ReconcileOutcome::default();

        let keys: Vec<VariantKey> = if colors.is_empty() {
            vec![base.with_color("")]
        } else {
            colors.iter().map(|c| base.with_color(c.as_str())).collect()
        };

        for key in keys {
            let mut variant = Variant::new(key);
            if let Some(source) = &color_source {
                if !variant.key.color.is_empty() {
                    variant.attributes.insert(
                        AttributeKey::Color,
                        Resolved {
                            value: variant.key.color.clone(),
                            source_id: source.source_id().to_string(),
                            rank: source.rank(),
                        },
                    );
                }
            }
            for attribute in AttributeKey::ALL {
                if attribute == AttributeKey::Color {
                    continue;
                }
                if let Some(resolved) = self.resolve(&variant.key, attribute) {
                    variant.attributes.insert(attribute, resolved);
                }
            }

            let missing: Vec<String> = self
                .required
                .iter()
                .filter(|r| !r.satisfied_by(&variant))
                .map(RequiredAttribute::label)
                .collect();
            if missing.is_empty() {
                outcome.variants.push(variant);
            } else {
                info!(variant = %variant.key, missing = ?missing, "variant excluded");
                outcome.exclusions.push(Exclusion {
                    key: variant.key,
                    missing,
                });
            }
        }

        outcome
    }

    pub fn reconcile_all<'a>(&self, bases: impl IntoIterator<Item = &'a BaseVariant>) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        for base in bases {
            outcome.extend(self.reconcile(base));
        }
        outcome
    }

    fn fan_out_colors(&self, base: &BaseVariant) -> (Vec<String>, Option<Arc<dyn AttributeSource>>) {
        for source in &self.sources {
            if !source.supports(AttributeKey::Color) {
                continue;
            }
            let mut seen = HashSet::new();
            let colors: Vec<String> = source
                .colors(base)
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty() && seen.insert(normalize_identity_part(c)))
                .collect();
            if !colors.is_empty() {
                return (colors, Some(Arc::clone(source)));
            }
        }
        (Vec::new(), None)
    }

    /// First non-blank value wins whole.
    fn resolve(&self, key: &VariantKey, attribute: AttributeKey) -> Option<Resolved> {
        self.sources
            .iter()
            .filter(|s| s.supports(attribute))
            .find_map(|source| {
                let value = source.lookup(key, attribute)?;
                let value = value.trim();
                (!value.is_empty()).then(|| Resolved {
                    value: value.to_string(),
                    source_id: source.source_id().to_string(),
                    rank: source.rank(),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use offerfeed_core::SourceRank;

    struct FakeSource {
        id: &'static str,
        rank: SourceRank,
        supplies: Vec<AttributeKey>,
        values: BTreeMap<AttributeKey, String>,
        colors: Vec<String>,
        queried: Mutex<Vec<AttributeKey>>,
    }

    impl FakeSource {
        fn new(id: &'static str, rank: SourceRank) -> Self {
            Self {
                id,
                rank,
                supplies: Vec::new(),
                values: BTreeMap::new(),
                colors: Vec::new(),
                queried: Mutex::new(Vec::new()),
            }
        }

        fn with(mut self, key: AttributeKey, value: &str) -> Self {
            self.supplies.push(key);
            self.values.insert(key, value.to_string());
            self
        }

        fn with_colors(mut self, colors: &[&str]) -> Self {
            self.supplies.push(AttributeKey::Color);
            self.colors = colors.iter().map(|c| c.to_string()).collect();
            self
        }
    }

    impl AttributeSource for FakeSource {
        fn source_id(&self) -> &str {
            self.id
        }

        fn rank(&self) -> SourceRank {
            self.rank
        }

        fn supplies(&self) -> &[AttributeKey] {
            &self.supplies
        }

        fn lookup(&self, _variant: &VariantKey, key: AttributeKey) -> Option<String> {
            self.queried.lock().expect("lock").push(key);
            self.values.get(&key).cloned()
        }

        fn colors(&self, _base: &BaseVariant) -> Vec<String> {
            self.colors.clone()
        }
    }

    fn base() -> BaseVariant {
        BaseVariant::new("Tonale", "Veloce", "Hybrid")
    }

    #[test]
    fn color_from_first_source_and_image_from_second_are_not_blended() {
        let a = Arc::new(
            FakeSource::new("page", SourceRank::PageEmbedded)
                .with_colors(&["Rosso Alfa"])
                .with(AttributeKey::Link, "https://dealer.example/tonale")
                .with(AttributeKey::Installment, "1299"),
        );
        let b = Arc::new(
            FakeSource::new("api", SourceRank::StructuredApi)
                .with_colors(&["Blu Misano", "Rosso Alfa"])
                .with(AttributeKey::Image, "https://cdn.example/tonale.png")
                .with(AttributeKey::Installment, "999"),
        );

        let reconciler = Reconciler::new(vec![
            b.clone() as Arc<dyn AttributeSource>,
            a.clone() as Arc<dyn AttributeSource>,
        ]);
        assert_eq!(reconciler.source_ids(), vec!["page", "api"]);
        let outcome = reconciler.reconcile(&base());

        assert!(outcome.exclusions.is_empty());
        assert_eq!(outcome.variants.len(), 1);
        let variant = &outcome.variants[0];
        assert_eq!(variant.key.color, "Rosso Alfa");
        assert_eq!(variant.source_of(AttributeKey::Color), Some("page"));
        assert_eq!(variant.value(AttributeKey::Image), Some("https://cdn.example/tonale.png"));
        assert_eq!(variant.source_of(AttributeKey::Image), Some("api"));
        assert_eq!(variant.value(AttributeKey::Installment), Some("1299"));
        assert_eq!(variant.source_of(AttributeKey::Installment), Some("page"));
    }

    #[test]
    fn sources_without_capability_are_never_queried() {
        let a = Arc::new(
            FakeSource::new("page", SourceRank::PageEmbedded)
                .with(AttributeKey::Link, "https://dealer.example/tonale"),
        );
        let reconciler = Reconciler::new(vec![a.clone() as Arc<dyn AttributeSource>]);
        reconciler.reconcile(&base());
        assert_eq!(*a.queried.lock().expect("lock"), vec![AttributeKey::Link]);
    }

    #[test]
    fn blank_values_fall_through_to_lower_ranks() {
        let a = Arc::new(
            FakeSource::new("page", SourceRank::PageEmbedded)
                .with(AttributeKey::Image, "   ")
                .with(AttributeKey::Price, "159900"),
        );
        let d = Arc::new(
            FakeSource::new("defaults", SourceRank::GenericDefault)
                .with(AttributeKey::Image, "https://cdn.example/generic.png")
                .with(AttributeKey::Link, "https://dealer.example"),
        );
        let outcome = Reconciler::new(vec![a as Arc<dyn AttributeSource>, d]).reconcile(&base());
        let variant = &outcome.variants[0];
        assert_eq!(variant.key.color, "");
        assert_eq!(variant.source_of(AttributeKey::Image), Some("defaults"));
        assert_eq!(variant.value(AttributeKey::Color), None);
    }

    #[test]
    fn variants_missing_required_attributes_are_excluded() {
        let a = Arc::new(
            FakeSource::new("page", SourceRank::PageEmbedded)
                .with_colors(&["Nero", "Bianco"])
                .with(AttributeKey::Link, "https://dealer.example/tonale"),
        );
        let outcome = Reconciler::new(vec![a as Arc<dyn AttributeSource>]).reconcile(&base());
        assert!(outcome.variants.is_empty());
        assert_eq!(outcome.exclusions.len(), 2);
        assert_eq!(outcome.exclusions[0].missing, vec!["image", "price|installment"]);
    }
}
