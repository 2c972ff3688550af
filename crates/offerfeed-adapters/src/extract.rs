//! Named-template offer extraction from legal and marketing text.
//!
//! Every template is a case-insensitive, dot-matches-newline regex whose named
//! groups map onto [`RawOfferRecord`] fields:
//!
//! | group          | field                         |
//! |----------------|-------------------------------|
//! | `trim`         | `trim_hint`                   |
//! | `price`        | `full_price`                  |
//! | `months`       | `term_months`                 |
//! | `down_payment` | `down_payment` (amount)       |
//! | `down_pct`     | `down_payment` (percentage)   |
//! | `installment`  | `installment`                 |
//!
//! The disclaimer of an offer is whatever follows its match, up to the next
//! match, clipped to the last full sentence.

use std::iter::Peekable;

use offerfeed_core::{DownPayment, RawOfferRecord};
use regex::{CaptureMatches, Captures, Regex, RegexBuilder};
use thiserror::Error;
use tracing::trace;

pub const OFFER_FIELDS: [&str; 6] = ["trim", "price", "months", "down_payment", "down_pct", "installment"];

const DISCLAIMER_WINDOW: usize = 400;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("template {name}: invalid pattern: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
    #[error("template {name}: required field {field} has no capture group")]
    MissingGroup { name: String, field: String },
    #[error("template {name}: unknown field {field}")]
    UnknownField { name: String, field: String },
    #[error("template {0} is already registered")]
    DuplicateTemplate(String),
    #[error("template {0} is not registered")]
    UnknownTemplate(String),
}

#[derive(Debug, Clone)]
pub struct ExtractionTemplate {
    name: String,
    regex: Regex,
    required: Vec<String>,
}

impl ExtractionTemplate {
    pub fn new(name: &str, pattern: &str, required: &[&str]) -> Result<Self, ExtractError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .map_err(|source| ExtractError::InvalidPattern {
                name: name.to_string(),
                source,
            })?;

        let groups: Vec<&str> = regex.capture_names().flatten().collect();
        for field in required {
            if !OFFER_FIELDS.contains(field) {
                return Err(ExtractError::UnknownField {
                    name: name.to_string(),
                    field: field.to_string(),
                });
            }
            let present = if *field == "down_payment" {
                groups.contains(&"down_payment") || groups.contains(&"down_pct")
            } else {
                groups.contains(field)
            };
            if !present {
                return Err(ExtractError::MissingGroup {
                    name: name.to_string(),
                    field: field.to_string(),
                });
            }
        }

        Ok(Self {
            name: name.to_string(),
            regex,
            required: required.iter().map(|f| f.to_string()).collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn required_fields(&self) -> &[String] {
        &self.required
    }

    /// Lazily walks non-overlapping matches in document order. Call again to restart.
    pub fn offers<'t>(&'t self, text: &'t str) -> Offers<'t> {
        Offers {
            template: self,
            text,
            matches: self.regex.captures_iter(text).peekable(),
        }
    }

    fn record(&self, caps: &Captures<'_>, disclaimer: &str) -> Option<RawOfferRecord> {
        let group = |name: &str| caps.name(name).map(|m| m.as_str());

        let trim_hint = group("trim").map(normalize_text).unwrap_or_default();
        let full_price = group("price").and_then(parse_amount);
        let installment = group("installment").and_then(parse_amount);
        let term_months = group("months").and_then(parse_term);
        let down_payment = group("down_payment")
            .and_then(parse_amount)
            .map(DownPayment::Amount)
            .or_else(|| group("down_pct").and_then(parse_amount).map(DownPayment::Percent));

        for field in &self.required {
            let ok = match field.as_str() {
                "trim" => !trim_hint.is_empty(),
                "price" => full_price.is_some(),
                "installment" => installment.is_some(),
                "months" => term_months.is_some(),
                "down_payment" | "down_pct" => down_payment.is_some(),
                _ => true,
            };
            if !ok {
                trace!(template = %self.name, field = %field, "dropping offer with unparseable field");
                return None;
            }
        }

        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        Some(RawOfferRecord {
            template: self.name.clone(),
            trim_hint,
            full_price,
            installment,
            term_months,
            down_payment,
            source_context: normalize_text(whole),
            disclaimer: clip_disclaimer(disclaimer),
        })
    }
}

pub struct Offers<'t> {
    template: &'t ExtractionTemplate,
    text: &'t str,
    matches: Peekable<CaptureMatches<'t, 't>>,
}

impl Iterator for Offers<'_> {
    type Item = RawOfferRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let caps = self.matches.next()?;
            let end = caps.get(0).map(|m| m.end()).unwrap_or(self.text.len());
            let next_start = self
                .matches
                .peek()
                .and_then(|next| next.get(0))
                .map(|m| m.start())
                .unwrap_or(self.text.len());
            let trailing = self.text.get(end..next_start).unwrap_or_default();
            if let Some(record) = self.template.record(&caps, trailing) {
                return Some(record);
            }
        }
    }
}

/// Whitespace-collapsed text with NBSP variants turned into plain spaces.
pub fn normalize_text(input: &str) -> String {
    input
        .split(|c: char| c.is_whitespace() || c == '\u{a0}' || c == '\u{202f}')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses "159 900", "1.299", "1'299,50", "189 900,00 zł" style amounts.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == ',');
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let (integer, fraction) = match cleaned.rfind(['.', ',']) {
        Some(pos) if (1..=2).contains(&(cleaned.len() - pos - 1)) => {
            (&cleaned[..pos], Some(&cleaned[pos + 1..]))
        }
        _ => (cleaned, None),
    };
    let digits: String = integer.chars().filter(|c| c.is_ascii_digit()).collect();
    let number = match fraction {
        Some(f) => format!("{}.{f}", if digits.is_empty() { "0" } else { &digits }),
        None => digits,
    };
    number.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_term(raw: &str) -> Option<u32> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok().filter(|months: &u32| *months > 0)
}

fn clip_disclaimer(trailing: &str) -> Option<String> {
    let window: String = normalize_text(trailing).chars().take(DISCLAIMER_WINDOW).collect();
    let clipped = match window.rfind('.') {
        Some(pos) => &window[..=pos],
        None => window.as_str(),
    };
    let clipped = clipped.trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '.' | ',' | ':' | ';' | '*'));
    let clipped = clipped.trim();
    if clipped.chars().filter(|c| c.is_alphabetic()).count() < 3 {
        return None;
    }
    let mut chars = clipped.chars();
    chars
        .next()
        .map(|first| first.to_uppercase().chain(chars).collect())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Found {
        template: String,
        offers: Vec<RawOfferRecord>,
    },
    NoOffers,
}

impl Extraction {
    pub fn offers(&self) -> &[RawOfferRecord] {
        match self {
            Extraction::Found { offers, .. } => offers,
            Extraction::NoOffers => &[],
        }
    }

    pub fn template(&self) -> Option<&str> {
        match self {
            Extraction::Found { template, .. } => Some(template),
            Extraction::NoOffers => None,
        }
    }

    pub fn into_offers(self) -> Vec<RawOfferRecord> {
        match self {
            Extraction::Found { offers, .. } => offers,
            Extraction::NoOffers => Vec::new(),
        }
    }
}

/// Ordered set of templates, tried first to last.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: Vec<ExtractionTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Result<Self, ExtractError> {
        let mut registry = Self::new();
        registry.register(ExtractionTemplate::new(
            "financing_disclaimer",
            r"modelu\s+(?P<trim>[^:]+?):\s*cena.+?brutto\s*(?P<price>\d[\d\s.,]*?)\s*(?:zł|pln).+?okres.+?(?P<months>\d+)\s*mies.+?wpłata.+?(?P<down_pct>\d+(?:[.,]\d+)?)\s*(?:%|proc).+?netto:?\s*(?P<installment>\d[\d\s.,]*?)\s*(?:zł|pln)",
            &["trim", "price", "months", "down_payment", "installment"],
        )?)?;
        registry.register(ExtractionTemplate::new(
            "installment_legal_note",
            r"od\s*(?P<installment>\d[\d\s.,]*?)\s*zł\s*netto(?:.{0,200}?(?P<price>\d[\d\s.,]*?)\s*zł\s*brutto)?",
            &["installment"],
        )?)?;
        registry.register(ExtractionTemplate::new(
            "gross_price",
            r"(?P<price>\d[\d\s.,]*?)\s*zł\s*brutto",
            &["price"],
        )?)?;
        Ok(registry)
    }

    pub fn register(&mut self, template: ExtractionTemplate) -> Result<(), ExtractError> {
        if self.get(template.name()).is_some() {
            return Err(ExtractError::DuplicateTemplate(template.name().to_string()));
        }
        self.templates.push(template);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ExtractionTemplate> {
        self.templates.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.iter().map(|t| t.name()).collect()
    }

    /// Registry restricted to `names`, in that order.
    pub fn select(&self, names: &[String]) -> Result<Self, ExtractError> {
        let mut selected = Self::new();
        for name in names {
            let template = self
                .get(name)
                .ok_or_else(|| ExtractError::UnknownTemplate(name.clone()))?;
            selected.register(template.clone())?;
        }
        Ok(selected)
    }

    /// First template yielding any offer wins; later templates are not tried.
    pub fn extract(&self, text: &str) -> Extraction {
        let text = normalize_text(text);
        for template in &self.templates {
            let offers: Vec<_> = template.offers(&text).collect();
            if !offers.is_empty() {
                return Extraction::Found {
                    template: template.name().to_string(),
                    offers,
                };
            }
        }
        Extraction::NoOffers
    }

    pub fn extract_with_fallback(&self, primary: &str, fallback: &str) -> Extraction {
        match self.extract(primary) {
            Extraction::NoOffers => self.extract(fallback),
            found => found,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_BLOCKS: &str = "Założenia przyjęte do kalkulacji modelu Tonale 1.5 Hybrid 160 KM Sprint: \
        cena katalogowa brutto 159\u{a0}900 zł, okres leasingu 36 mies., wpłata początkowa 10 %, \
        miesięczna rata leasingowa netto: 1\u{a0}299 zł. Oferta ważna do 31.12.2025 r. \
        Założenia przyjęte do kalkulacji modelu Tonale 1.5 Hybrid 160 KM Veloce: \
        cena katalogowa brutto 189 900 zł, okres leasingu 48 mies., wpłata początkowa 20 %, \
        miesięczna rata leasingowa netto: 1 599 zł. Szczegóły u dealera";

    #[test]
    fn sequential_blocks_yield_separate_records_in_order() {
        let registry = TemplateRegistry::with_defaults().expect("defaults");
        let extraction = registry.extract(TWO_BLOCKS);
        assert_eq!(extraction.template(), Some("financing_disclaimer"));

        let offers = extraction.offers();
        assert_eq!(offers.len(), 2);

        assert_eq!(offers[0].trim_hint, "Tonale 1.5 Hybrid 160 KM Sprint");
        assert_eq!(offers[0].full_price, Some(159_900.0));
        assert_eq!(offers[0].term_months, Some(36));
        assert_eq!(offers[0].down_payment, Some(DownPayment::Percent(10.0)));
        assert_eq!(offers[0].installment, Some(1_299.0));
        assert_eq!(
            offers[0].disclaimer.as_deref(),
            Some("Oferta ważna do 31.12.2025 r.")
        );

        assert_eq!(offers[1].trim_hint, "Tonale 1.5 Hybrid 160 KM Veloce");
        assert_eq!(offers[1].full_price, Some(189_900.0));
        assert_eq!(offers[1].term_months, Some(48));
        assert_eq!(offers[1].down_payment, Some(DownPayment::Percent(20.0)));
        assert_eq!(offers[1].installment, Some(1_599.0));
        assert_eq!(offers[1].disclaimer, None);
    }

    #[test]
    fn offers_iterator_restarts_from_the_beginning() {
        let registry = TemplateRegistry::with_defaults().expect("defaults");
        let template = registry.get("financing_disclaimer").expect("template");
        let text = normalize_text(TWO_BLOCKS);
        let mut first = template.offers(&text);
        assert!(first.next().is_some());
        assert_eq!(template.offers(&text).count(), 2);
    }

    #[test]
    fn unparseable_required_field_drops_only_that_record() {
        let template = ExtractionTemplate::new(
            "price_tag",
            r"cena:\s*(?P<price>[^;]*);",
            &["price"],
        )
        .expect("template");
        let prices: Vec<_> = template
            .offers("cena: 99 900; cena: brak; cena: 120.000,50;")
            .map(|o| o.full_price)
            .collect();
        assert_eq!(prices, vec![Some(99_900.0), Some(120_000.5)]);
    }

    #[test]
    fn required_field_without_group_is_rejected() {
        let err = ExtractionTemplate::new("broken", r"od (?P<price>\d+) zł", &["installment"])
            .expect_err("missing group");
        assert!(matches!(err, ExtractError::MissingGroup { ref field, .. } if field == "installment"));
        assert!(matches!(
            ExtractionTemplate::new("bad", r"(?P<price>", &[]),
            Err(ExtractError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn legal_note_falls_back_to_page_body() {
        let registry = TemplateRegistry::with_defaults()
            .expect("defaults")
            .select(&["installment_legal_note".to_string()])
            .expect("select");
        let note = "Zdjęcia mają charakter poglądowy.";
        let body = "DS 7 E-TENSE. Od 1\u{202f}999 zł netto/mies. w leasingu, cena od 189 900 zł brutto.";

        let extraction = registry.extract_with_fallback(note, body);
        let offers = extraction.offers();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].installment, Some(1_999.0));
        assert_eq!(offers[0].full_price, Some(189_900.0));
        assert_eq!(registry.extract(note), Extraction::NoOffers);
    }

    #[test]
    fn amounts_handle_separators_and_decimals() {
        assert_eq!(parse_amount("159 900"), Some(159_900.0));
        assert_eq!(parse_amount("1.299"), Some(1_299.0));
        assert_eq!(parse_amount("1'299,50"), Some(1_299.5));
        assert_eq!(parse_amount("189\u{a0}900,00 zł"), Some(189_900.0));
        assert_eq!(parse_amount("zł"), None);
        assert_eq!(parse_term("36 mies."), Some(36));
    }
}
