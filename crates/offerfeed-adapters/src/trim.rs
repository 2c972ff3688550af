use std::collections::HashMap;

use offerfeed_core::normalize_identity_part;

/// Known trims of one model, ordered so that longer names are tried first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimCatalog {
    names: Vec<String>,
    default: String,
}

impl TrimCatalog {
    pub fn new<I, S>(names: I, default: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names
            .into_iter()
            .map(Into::into)
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        names.sort_by(|a, b| {
            b.chars()
                .count()
                .cmp(&a.chars().count())
                .then_with(|| a.to_lowercase().cmp(&b.to_lowercase()))
                .then_with(|| a.cmp(b))
        });
        names.dedup_by(|a, b| a.to_lowercase() == b.to_lowercase());

        Self {
            names,
            default: default.into(),
        }
    }

    pub fn default_only(default: impl Into<String>) -> Self {
        Self::new(Vec::<String>::new(), default)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn default_trim(&self) -> &str {
        &self.default
    }

    /// Longest canonical name contained in `hint`, ignoring case; the default otherwise.
    pub fn resolve(&self, hint: &str) -> &str {
        if hint.trim().is_empty() {
            return &self.default;
        }
        let hint = hint.to_lowercase();
        self.names
            .iter()
            .find(|name| hint.contains(&name.to_lowercase()))
            .map(String::as_str)
            .unwrap_or(&self.default)
    }
}

/// Per-model catalogs for one run.
#[derive(Debug, Clone, Default)]
pub struct TrimCatalogs {
    by_model: HashMap<String, TrimCatalog>,
    fallback: Option<TrimCatalog>,
}

impl TrimCatalogs {
    pub fn new(fallback_default: impl Into<String>) -> Self {
        Self {
            by_model: HashMap::new(),
            fallback: Some(TrimCatalog::default_only(fallback_default)),
        }
    }

    pub fn insert(&mut self, model: &str, catalog: TrimCatalog) {
        self.by_model.insert(normalize_identity_part(model), catalog);
    }

    pub fn get(&self, model: &str) -> Option<&TrimCatalog> {
        self.by_model.get(&normalize_identity_part(model))
    }

    pub fn resolve<'a>(&'a self, model: &str, hint: &str) -> &'a str {
        match self.get(model).or(self.fallback.as_ref()) {
            Some(catalog) => catalog.resolve(hint),
            None => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STELVIO: [&str; 4] = ["Ibrida", "Speciale", "Sport Speciale", "Ibrida Q4 Sport Speciale"];

    #[test]
    fn longest_match_wins() {
        let catalog = TrimCatalog::new(STELVIO, "Standard");
        assert_eq!(catalog.resolve("Ibrida Q4 Sport Speciale"), "Ibrida Q4 Sport Speciale");
        assert_eq!(catalog.resolve("Stelvio 2.0 Sport Speciale Q4"), "Sport Speciale");
        assert_eq!(catalog.resolve("stelvio ibrida"), "Ibrida");
        assert_eq!(catalog.resolve("Quadrifoglio"), "Standard");
    }

    #[test]
    fn resolution_is_independent_of_input_order() {
        let forward = TrimCatalog::new(STELVIO, "Standard");
        let mut reversed_names = STELVIO.to_vec();
        reversed_names.reverse();
        let reversed = TrimCatalog::new(reversed_names, "Standard");

        assert_eq!(forward, reversed);
        for hint in ["Ibrida Q4 Sport Speciale", "Speciale Ibrida", "Tributo Italiano"] {
            assert_eq!(forward.resolve(hint), reversed.resolve(hint));
        }
    }

    #[test]
    fn equal_length_names_tie_break_on_name() {
        let catalog = TrimCatalog::new(["Veloce", "SPRINT", "Sprint", "Intensa"], "Standard");
        assert_eq!(catalog.names(), ["Intensa", "SPRINT", "Veloce"]);
        assert_eq!(catalog.resolve("Tonale Sprint Veloce"), "SPRINT");
    }

    #[test]
    fn empty_hint_returns_default() {
        let catalog = TrimCatalog::new(STELVIO, "Standard");
        assert_eq!(catalog.resolve("   "), "Standard");
    }

    #[test]
    fn unknown_model_uses_default_only_catalog() {
        let mut catalogs = TrimCatalogs::new("Standard");
        catalogs.insert("Stelvio", TrimCatalog::new(STELVIO, "Sprint"));
        assert_eq!(catalogs.resolve(" STELVIO ", "x"), "Sprint");
        assert_eq!(catalogs.resolve("Giulia", "Veloce"), "Standard");
    }
}
