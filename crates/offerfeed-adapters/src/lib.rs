//! Attribute sources over model pages, configurator API payloads, prior
//! inventories and static defaults, plus the offer text extractor and trim
//! disambiguation they feed. Dealer stock listings are parsed in [`stock`].

pub mod extract;
pub mod stock;
pub mod trim;

use std::collections::{BTreeMap, HashSet};

use offerfeed_core::{
    normalize_identity_part, AttributeKey, AttributeMap, BaseVariant, RawOfferRecord, SourceRank,
    VariantKey,
};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub use extract::{
    normalize_text, parse_amount, parse_term, ExtractError, Extraction, ExtractionTemplate,
    Offers, TemplateRegistry,
};
pub use stock::{title_case_slug, StockAttributes, StockDetail, StockDetailParser, StockListing};
pub use trim::{TrimCatalog, TrimCatalogs};

pub const CRATE_NAME: &str = "offerfeed-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A ranked provider of some attributes for some variants.
///
/// Sources only answer for the keys listed in [`AttributeSource::supplies`];
/// the reconciler never asks them for anything else.
pub trait AttributeSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn rank(&self) -> SourceRank;
    fn supplies(&self) -> &[AttributeKey];

    fn supports(&self, key: AttributeKey) -> bool {
        self.supplies().contains(&key)
    }

    fn lookup(&self, variant: &VariantKey, key: AttributeKey) -> Option<String>;

    /// Exterior colors offered for `base`; empty when the source has no opinion.
    fn colors(&self, _base: &BaseVariant) -> Vec<String> {
        Vec::new()
    }
}

/// Whole-number amounts print without decimals.
pub fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = normalize_text(&value);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn fragment_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    normalize_text(&fragment.root_element().text().collect::<Vec<_>>().join(" "))
}

/// Page text as a reader sees it: script and style bodies are skipped.
pub fn visible_text(document: &Html) -> String {
    let mut parts = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| matches!(e.name(), "script" | "style" | "noscript")))
            .unwrap_or(false);
        if hidden {
            continue;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed);
        }
    }
    normalize_text(&parts.join(" "))
}

/// Resolves `href` against `base` with standard URL joining rules.
pub fn absolutize(base: Option<&str>, href: &str) -> String {
    let href = href.trim();
    if let Ok(url) = Url::parse(href) {
        return url.into();
    }
    let joined = match base.and_then(|b| Url::parse(b.trim()).ok()) {
        Some(base) => base.join(href),
        None if href.starts_with("//") => Url::parse(&format!("https:{href}")),
        None => return href.to_string(),
    };
    joined.map(String::from).unwrap_or_else(|_| href.to_string())
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_path(value, path)?.as_str()
}

/// Numbers or numeric strings.
fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let cur = json_path(value, path)?;
    cur.as_f64().or_else(|| cur.as_str().and_then(parse_amount))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorSlide {
    pub name: String,
    pub image: String,
}

/// Marketing page reduced to what offer extraction needs: embedded legal
/// notes, color carousels and the visible body text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedPage {
    pub legal_notes: Vec<String>,
    pub slides: Vec<ColorSlide>,
    pub body_text: String,
}

impl EmbeddedPage {
    pub fn parse(html: &str, base_url: Option<&str>) -> Result<Self, AdapterError> {
        let document = Html::parse_document(html);
        let components = selector("[data-app-wl]")?;
        let mut page = EmbeddedPage {
            body_text: visible_text(&document),
            ..Default::default()
        };
        let mut seen_colors = HashSet::new();

        for element in document.select(&components) {
            let app = element.value().attr("data-app-wl").unwrap_or_default();
            let Some(raw) = element.value().attr("data-props") else {
                continue;
            };
            let props: JsonValue = match serde_json::from_str(raw) {
                Ok(props) => props,
                Err(err) => {
                    debug!(component = app, error = %err, "skipping component with unreadable props");
                    continue;
                }
            };

            if let Some(note) = json_str(&props, &["legalNote"]) {
                if let Some(text) = text_or_none(fragment_text(note)) {
                    page.legal_notes.push(text);
                }
            }

            let Some(slides) = props.get("slides").and_then(JsonValue::as_array) else {
                continue;
            };
            let candidates: Vec<ColorSlide> = slides
                .iter()
                .filter_map(|slide| {
                    let title = fragment_text(json_str(slide, &["title"])?);
                    let image = json_str(slide, &["image", "desktopImg"])
                        .or_else(|| json_str(slide, &["image", "src"]))?;
                    let len = title.chars().count();
                    (len > 3 && len < 40).then(|| ColorSlide {
                        name: title,
                        image: absolutize(base_url, image),
                    })
                })
                .collect();
            // A single slide is a hero banner, not a color picker.
            if candidates.len() >= 2 {
                for slide in candidates {
                    if seen_colors.insert(normalize_identity_part(&slide.name)) {
                        page.slides.push(slide);
                    }
                }
            }
        }

        Ok(page)
    }

    pub fn legal_text(&self) -> String {
        self.legal_notes.join(" ")
    }
}

/// An offer read from a page with the trim and powertrain its heading names.
/// `trim: None` marks an offer that applies to every trim of the model.
#[derive(Debug, Clone, PartialEq)]
pub struct PageOffer {
    pub trim: Option<String>,
    pub powertrain: Option<String>,
    pub record: RawOfferRecord,
}

impl PageOffer {
    pub fn new(trim: Option<String>, record: RawOfferRecord) -> Self {
        let powertrain = powertrain_from_hint(&record.trim_hint).map(ToString::to_string);
        Self {
            trim,
            powertrain,
            record,
        }
    }
}

/// Offers and colors read from a model's own page. Highest-priority source.
#[derive(Debug, Clone)]
pub struct PageEmbeddedSource {
    source_id: String,
    link: Option<String>,
    slides: Vec<ColorSlide>,
    /// Keyed by normalized (trim, powertrain); an unnamed powertrain is the empty string.
    offers: BTreeMap<(String, String), RawOfferRecord>,
    model_wide: Option<RawOfferRecord>,
    capabilities: Vec<AttributeKey>,
}

impl PageEmbeddedSource {
    pub fn new(
        source_id: impl Into<String>,
        link: Option<String>,
        slides: Vec<ColorSlide>,
        offers: Vec<PageOffer>,
    ) -> Self {
        let source_id = source_id.into();
        let mut by_key = BTreeMap::new();
        let mut model_wide = None;
        for offer in offers {
            match offer.trim {
                Some(trim) => {
                    let key = (
                        normalize_identity_part(&trim),
                        offer
                            .powertrain
                            .as_deref()
                            .map(normalize_identity_part)
                            .unwrap_or_default(),
                    );
                    if by_key.contains_key(&key) {
                        debug!(source_id = %source_id, trim = %key.0, powertrain = %key.1, "repeated offer ignored");
                        continue;
                    }
                    by_key.insert(key, offer.record);
                }
                None => {
                    model_wide.get_or_insert(offer.record);
                }
            }
        }

        let mut capabilities = Vec::new();
        if link.is_some() {
            capabilities.push(AttributeKey::Link);
        }
        if !slides.is_empty() {
            capabilities.extend([AttributeKey::Color, AttributeKey::Image]);
        }
        if !by_key.is_empty() || model_wide.is_some() {
            capabilities.extend([
                AttributeKey::Price,
                AttributeKey::Installment,
                AttributeKey::TermMonths,
                AttributeKey::DownPayment,
                AttributeKey::Disclaimer,
            ]);
        }

        Self {
            source_id,
            link,
            slides,
            offers: by_key,
            model_wide,
            capabilities,
        }
    }

    /// Exact trim and powertrain first, then an offer that names no powertrain,
    /// then the trim's only offer, then the model-wide one.
    fn offer_for(&self, variant: &VariantKey) -> Option<&RawOfferRecord> {
        let trim = normalize_identity_part(&variant.trim);
        let powertrain = normalize_identity_part(&variant.powertrain);
        if let Some(offer) = self
            .offers
            .get(&(trim.clone(), powertrain))
            .or_else(|| self.offers.get(&(trim.clone(), String::new())))
        {
            return Some(offer);
        }
        let mut same_trim = self
            .offers
            .range((trim.clone(), String::new())..)
            .take_while(|((t, _), _)| *t == trim)
            .map(|(_, offer)| offer);
        match (same_trim.next(), same_trim.next()) {
            (Some(only), None) => Some(only),
            _ => self.model_wide.as_ref(),
        }
    }
}

impl AttributeSource for PageEmbeddedSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn rank(&self) -> SourceRank {
        SourceRank::PageEmbedded
    }

    fn supplies(&self) -> &[AttributeKey] {
        &self.capabilities
    }

    fn lookup(&self, variant: &VariantKey, key: AttributeKey) -> Option<String> {
        match key {
            AttributeKey::Link => self.link.clone(),
            AttributeKey::Image => self
                .slides
                .iter()
                .find(|s| same_color(&s.name, &variant.color))
                .map(|s| s.image.clone()),
            AttributeKey::Price => self.offer_for(variant)?.full_price.map(format_amount),
            AttributeKey::Installment => self.offer_for(variant)?.installment.map(format_amount),
            AttributeKey::TermMonths => self
                .offer_for(variant)?
                .term_months
                .map(|m| m.to_string()),
            AttributeKey::DownPayment => {
                let offer = self.offer_for(variant)?;
                let down = offer.down_payment?;
                Some(match down.resolve_amount(offer.full_price) {
                    Some(amount) => amount.to_string(),
                    None => down.to_string(),
                })
            }
            AttributeKey::Disclaimer => self.offer_for(variant)?.disclaimer.clone(),
            _ => None,
        }
    }

    fn colors(&self, _base: &BaseVariant) -> Vec<String> {
        self.slides.iter().map(|s| s.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiColor {
    pub id: String,
    pub name: String,
    pub image: Option<String>,
}

/// One sellable version from a configurator `versions` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiVersion {
    pub trim: String,
    pub fuel_type: String,
    pub engine: String,
    pub transmission: String,
    pub base_price: Option<f64>,
    pub lcdv: String,
    pub colors: Vec<ApiColor>,
}

pub fn fuel_type_for(energy_id: &str, engine_label: &str) -> &'static str {
    let fuel = match energy_id {
        "01" => "Hybrid",
        "04" => "Diesel",
        "05" => "Electric",
        "10" => "Plug-in Hybrid",
        _ => "Gasoline",
    };
    if fuel == "Gasoline" && engine_label.to_lowercase().contains("hybrid") {
        "Hybrid"
    } else {
        fuel
    }
}

/// Powertrain named in an offer heading, in the vocabulary of [`fuel_type_for`].
pub fn powertrain_from_hint(hint: &str) -> Option<&'static str> {
    let hint = hint.to_lowercase();
    let tokens: Vec<&str> = hint
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let any = |pred: &dyn Fn(&str) -> bool| tokens.iter().any(|&t| pred(t));

    if hint.contains("plug-in") || hint.contains("plug in") || any(&|t| t == "phev") {
        Some("Plug-in Hybrid")
    } else if any(&|t| {
        t == "bev" || t.starts_with("electric") || t.starts_with("elektry") || t.starts_with("elettric")
    }) {
        Some("Electric")
    } else if any(&|t| t.starts_with("hybr") || t == "mhev") {
        Some("Hybrid")
    } else if any(&|t| t == "diesel" || t.ends_with("hdi")) {
        Some("Diesel")
    } else if any(&|t| t.starts_with("benzyn") || t == "puretech") {
        Some("Gasoline")
    } else {
        None
    }
}

/// Color names match across sources regardless of case, spacing and diacritic casing.
pub fn same_color(a: &str, b: &str) -> bool {
    normalize_identity_part(a) == normalize_identity_part(b)
}

impl ApiVersion {
    pub fn from_json(value: &JsonValue, render_url_template: Option<&str>) -> Self {
        let trim = json_str(value, &["grCommercialName", "label"])
            .map(normalize_text)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Standard".to_string());
        let engine = json_str(value, &["grEngine", "label"])
            .map(normalize_text)
            .unwrap_or_default();
        let energy = json_str(value, &["energy", "id"]).unwrap_or("02");
        let lcdv = json_str(value, &["lcdv"]).unwrap_or_default().to_string();

        let categories = json_path(value, &["globalFeatures", "looks", "categories"])
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        // Renders without rim data come out wheel-less, so fall back to swatches.
        let has_rims = categories
            .iter()
            .any(|c| json_str(c, &["id"]) == Some("rims"));

        let mut colors = Vec::new();
        for category in categories {
            if json_str(category, &["id"]) != Some("exteriors") {
                continue;
            }
            let features = category
                .get("features")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for feature in features {
                let (Some(name), Some(id)) = (
                    json_str(feature, &["label"]).map(normalize_text),
                    json_str(feature, &["id"]),
                ) else {
                    continue;
                };
                if name.is_empty() || id.is_empty() {
                    continue;
                }
                let image = match render_url_template {
                    Some(template) if has_rims && !lcdv.is_empty() => Some(
                        template.replace("{lcdv}", &lcdv).replace("{color}", id),
                    ),
                    _ => json_str(feature, &["visuals", "default"])
                        .filter(|s| !s.trim().is_empty())
                        .map(ToString::to_string),
                };
                colors.push(ApiColor {
                    id: id.to_string(),
                    name,
                    image,
                });
            }
        }

        Self {
            fuel_type: fuel_type_for(energy, &engine).to_string(),
            trim,
            engine,
            transmission: json_str(value, &["grTransmissionType", "label"])
                .map(normalize_text)
                .unwrap_or_default(),
            base_price: json_f64(value, &["prices", "price", "base"]).filter(|p| *p > 0.0),
            lcdv,
            colors,
        }
    }

    fn matches(&self, trim: &str, powertrain: &str) -> bool {
        normalize_identity_part(&self.trim) == normalize_identity_part(trim)
            && normalize_identity_part(&self.fuel_type) == normalize_identity_part(powertrain)
    }
}

/// Versions, prices and colors from a configurator API.
#[derive(Debug, Clone)]
pub struct ConfigApiSource {
    source_id: String,
    model: String,
    versions: Vec<ApiVersion>,
}

const CONFIG_API_CAPABILITIES: [AttributeKey; 4] = [
    AttributeKey::Price,
    AttributeKey::Powertrain,
    AttributeKey::Color,
    AttributeKey::Image,
];

impl ConfigApiSource {
    /// Accepts either a bare `versions` array or an object wrapping one.
    pub fn from_json(
        source_id: impl Into<String>,
        model: impl Into<String>,
        payload: &JsonValue,
        render_url_template: Option<&str>,
    ) -> Result<Self, AdapterError> {
        let list = payload
            .as_array()
            .or_else(|| payload.get("versions").and_then(JsonValue::as_array))
            .ok_or_else(|| AdapterError::Message("configurator payload has no versions list".into()))?;
        let mut versions: Vec<ApiVersion> = list
            .iter()
            .map(|v| ApiVersion::from_json(v, render_url_template))
            .collect();
        // Cheapest first so lookups resolve to the entry-level engine.
        versions.sort_by(|a, b| {
            a.base_price
                .unwrap_or(f64::MAX)
                .total_cmp(&b.base_price.unwrap_or(f64::MAX))
        });

        Ok(Self {
            source_id: source_id.into(),
            model: model.into(),
            versions,
        })
    }

    pub fn versions(&self) -> &[ApiVersion] {
        &self.versions
    }

    /// Distinct (trim, fuel) combinations in first-seen order.
    pub fn base_variants(&self) -> Vec<BaseVariant> {
        let mut seen = HashSet::new();
        self.versions
            .iter()
            .filter(|v| {
                seen.insert((
                    normalize_identity_part(&v.trim),
                    normalize_identity_part(&v.fuel_type),
                ))
            })
            .map(|v| BaseVariant::new(&self.model, &v.trim, &v.fuel_type))
            .collect()
    }

    fn matching<'a>(&'a self, trim: &'a str, powertrain: &'a str) -> impl Iterator<Item = &'a ApiVersion> + 'a {
        self.versions.iter().filter(move |v| v.matches(trim, powertrain))
    }
}

impl AttributeSource for ConfigApiSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn rank(&self) -> SourceRank {
        SourceRank::StructuredApi
    }

    fn supplies(&self) -> &[AttributeKey] {
        &CONFIG_API_CAPABILITIES
    }

    fn lookup(&self, variant: &VariantKey, key: AttributeKey) -> Option<String> {
        let mut versions = self.matching(&variant.trim, &variant.powertrain);
        match key {
            AttributeKey::Price => versions.find_map(|v| v.base_price).map(format_amount),
            AttributeKey::Powertrain => versions
                .map(|v| v.engine.clone())
                .find(|e| !e.is_empty()),
            AttributeKey::Image => versions.find_map(|v| {
                v.colors
                    .iter()
                    .find(|c| same_color(&c.name, &variant.color))
                    .and_then(|c| c.image.clone())
            }),
            _ => None,
        }
    }

    fn colors(&self, base: &BaseVariant) -> Vec<String> {
        let mut seen = HashSet::new();
        self.matching(&base.trim, &base.powertrain)
            .flat_map(|v| v.colors.iter())
            .filter(|c| seen.insert(normalize_identity_part(&c.name)))
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Uppercase alphanumerics only, for loose model matching against inventory titles.
pub fn model_match_key(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Colors and images from a previously published inventory feed.
#[derive(Debug, Clone)]
pub struct InventorySource {
    source_id: String,
    rows: Vec<BTreeMap<String, String>>,
}

const INVENTORY_CAPABILITIES: [AttributeKey; 2] = [AttributeKey::Color, AttributeKey::Image];

impl InventorySource {
    pub fn from_rows(source_id: impl Into<String>, rows: Vec<BTreeMap<String, String>>) -> Self {
        Self {
            source_id: source_id.into(),
            rows,
        }
    }

    pub fn from_csv(source_id: impl Into<String>, bytes: &[u8]) -> Result<Self, AdapterError> {
        let rows = offerfeed_storage::parse_catalog_csv(bytes)?;
        Ok(Self::from_rows(source_id, rows))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn rows_for<'a>(&'a self, model: &str) -> impl Iterator<Item = &'a BTreeMap<String, String>> + 'a {
        let key = model_match_key(model);
        self.rows.iter().filter(move |row| {
            !key.is_empty()
                && ["model", "title"].iter().any(|column| {
                    row.get(*column)
                        .map(|v| model_match_key(v).contains(&key))
                        .unwrap_or(false)
                })
        })
    }
}

fn non_empty(row: &BTreeMap<String, String>, column: &str) -> Option<String> {
    row.get(column)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

impl AttributeSource for InventorySource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn rank(&self) -> SourceRank {
        SourceRank::HistoricalInventory
    }

    fn supplies(&self) -> &[AttributeKey] {
        &INVENTORY_CAPABILITIES
    }

    fn lookup(&self, variant: &VariantKey, key: AttributeKey) -> Option<String> {
        match key {
            AttributeKey::Image => self.rows_for(&variant.model).find_map(|row| {
                let color = non_empty(row, "exterior_color")?;
                if same_color(&color, &variant.color) {
                    non_empty(row, "image_link")
                } else {
                    None
                }
            }),
            _ => None,
        }
    }

    fn colors(&self, base: &BaseVariant) -> Vec<String> {
        let mut seen = HashSet::new();
        self.rows_for(&base.model)
            .filter(|row| non_empty(row, "image_link").is_some())
            .filter_map(|row| non_empty(row, "exterior_color"))
            .filter(|color| seen.insert(normalize_identity_part(color)))
            .collect()
    }
}

/// Fixed values for every variant of a feed. Lowest priority.
#[derive(Debug, Clone)]
pub struct StaticSource {
    source_id: String,
    values: AttributeMap,
    capabilities: Vec<AttributeKey>,
}

impl StaticSource {
    pub fn new(source_id: impl Into<String>, values: AttributeMap) -> Self {
        let values: AttributeMap = values
            .into_iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        Self {
            source_id: source_id.into(),
            capabilities: values.keys().copied().collect(),
            values,
        }
    }
}

impl AttributeSource for StaticSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn rank(&self) -> SourceRank {
        SourceRank::GenericDefault
    }

    fn supplies(&self) -> &[AttributeKey] {
        &self.capabilities
    }

    fn lookup(&self, _variant: &VariantKey, key: AttributeKey) -> Option<String> {
        self.values.get(&key).cloned()
    }

    fn colors(&self, _base: &BaseVariant) -> Vec<String> {
        self.values
            .get(&AttributeKey::Color)
            .map(|c| vec![c.clone()])
            .unwrap_or_default()
    }
}
