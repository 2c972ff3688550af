//! Core domain model for offer extraction, reconciliation and publishing.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "offerfeed-core";

/// Version of the published column contract. Bump only with a downstream migration.
pub const CATALOG_SCHEMA_VERSION: u32 = 1;

pub const CATALOG_COLUMNS: [&str; 21] = [
    "vehicle_id",
    "title",
    "description",
    "make",
    "model",
    "year",
    "link",
    "image_link",
    "exterior_color",
    "trim",
    "fuel_type",
    "price",
    "offer_type",
    "amount_price",
    "amount_qualifier",
    "term_length",
    "offer_term_qualifier",
    "downpayment",
    "downpayment_qualifier",
    "offer_disclaimer",
    "offer_disclaimer_url",
];

/// Column contract of stock-inventory feeds: one line per physical vehicle.
pub const INVENTORY_COLUMNS: [&str; 24] = [
    "vehicle_id",
    "title",
    "description",
    "link",
    "image_link",
    "make",
    "model",
    "year",
    "mileage.value",
    "mileage.unit",
    "body_style",
    "exterior_color",
    "state_of_vehicle",
    "price",
    "currency",
    "address",
    "latitude",
    "longitude",
    "offer_type",
    "amount_price",
    "amount_qualifier",
    "fuel_type",
    "transmission",
    "drivetrain",
];

/// A line of a published artifact. `COLUMNS` is the header and the serialization order.
pub trait FeedRow: Serialize + Send + Sync {
    const COLUMNS: &'static [&'static str];

    fn vehicle_id(&self) -> &str;

    /// Names of required fields that are blank.
    fn missing_required(&self) -> Vec<&'static str>;
}

fn missing_common(
    vehicle_id: &str,
    title: &str,
    link: &str,
    price: &str,
    amount_price: &str,
    image_link: &str,
) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if vehicle_id.trim().is_empty() {
        missing.push("vehicle_id");
    }
    if title.trim().is_empty() {
        missing.push("title");
    }
    if link.trim().is_empty() {
        missing.push("link");
    }
    if price.trim().is_empty() && amount_price.trim().is_empty() {
        missing.push("price_or_installment");
    }
    if image_link.trim().is_empty() {
        missing.push("image_link");
    }
    missing
}

/// Down payment as written in an offer: either an absolute amount or a share of the full price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DownPayment {
    Amount(f64),
    Percent(f64),
}

impl DownPayment {
    /// Absolute amount in whole currency units. Percentages need the full price.
    pub fn resolve_amount(&self, full_price: Option<f64>) -> Option<u64> {
        let amount = match *self {
            DownPayment::Amount(v) => v,
            DownPayment::Percent(pct) => full_price? * pct / 100.0,
        };
        if amount.is_finite() && amount > 0.0 {
            Some(amount.trunc() as u64)
        } else {
            None
        }
    }
}

impl fmt::Display for DownPayment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownPayment::Amount(v) => write!(f, "{v}"),
            DownPayment::Percent(p) => write!(f, "{p}%"),
        }
    }
}

/// One offer recovered from unstructured text. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOfferRecord {
    pub template: String,
    pub trim_hint: String,
    pub full_price: Option<f64>,
    pub installment: Option<f64>,
    pub term_months: Option<u32>,
    pub down_payment: Option<DownPayment>,
    pub source_context: String,
    pub disclaimer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKey {
    Title,
    Link,
    Image,
    Color,
    Price,
    Installment,
    TermMonths,
    DownPayment,
    Disclaimer,
    Powertrain,
}

impl AttributeKey {
    pub const ALL: [AttributeKey; 10] = [
        AttributeKey::Title,
        AttributeKey::Link,
        AttributeKey::Image,
        AttributeKey::Color,
        AttributeKey::Price,
        AttributeKey::Installment,
        AttributeKey::TermMonths,
        AttributeKey::DownPayment,
        AttributeKey::Disclaimer,
        AttributeKey::Powertrain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeKey::Title => "title",
            AttributeKey::Link => "link",
            AttributeKey::Image => "image",
            AttributeKey::Color => "color",
            AttributeKey::Price => "price",
            AttributeKey::Installment => "installment",
            AttributeKey::TermMonths => "term_months",
            AttributeKey::DownPayment => "down_payment",
            AttributeKey::Disclaimer => "disclaimer",
            AttributeKey::Powertrain => "powertrain",
        }
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type AttributeMap = BTreeMap<AttributeKey, String>;

/// Fixed priority of a source kind. Lower ranks win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRank {
    PageEmbedded = 1,
    StructuredApi = 2,
    HistoricalInventory = 3,
    GenericDefault = 4,
}

/// Trims, lowercases and collapses inner whitespace of one identifying field.
pub fn normalize_identity_part(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A sellable configuration before color fan-out.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BaseVariant {
    pub model: String,
    pub trim: String,
    pub powertrain: String,
}

impl BaseVariant {
    pub fn new(model: impl Into<String>, trim: impl Into<String>, powertrain: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            trim: trim.into(),
            powertrain: powertrain.into(),
        }
    }

    pub fn with_color(&self, color: impl Into<String>) -> VariantKey {
        VariantKey {
            model: self.model.clone(),
            trim: self.trim.clone(),
            powertrain: self.powertrain.clone(),
            color: color.into(),
        }
    }
}

impl fmt::Display for BaseVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} / {}", self.model, self.trim, self.powertrain)
    }
}

/// Identity of one catalog row: model x trim x fuel/engine x exterior color.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VariantKey {
    pub model: String,
    pub trim: String,
    pub powertrain: String,
    pub color: String,
}

impl VariantKey {
    pub fn base(&self) -> BaseVariant {
        BaseVariant::new(&self.model, &self.trim, &self.powertrain)
    }

    /// Normalized `model|trim|powertrain|color`, the input of identifier hashing.
    pub fn normalized(&self) -> String {
        [&self.model, &self.trim, &self.powertrain, &self.color]
            .iter()
            .map(|part| normalize_identity_part(part))
            .collect::<Vec<_>>()
            .join("|")
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} / {} / {}",
            self.model, self.trim, self.powertrain, self.color
        )
    }
}

/// Attribute value plus the source that supplied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolved {
    pub value: String,
    pub source_id: String,
    pub rank: SourceRank,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub key: VariantKey,
    pub attributes: BTreeMap<AttributeKey, Resolved>,
}

impl Variant {
    pub fn new(key: VariantKey) -> Self {
        Self {
            key,
            attributes: BTreeMap::new(),
        }
    }

    pub fn value(&self, key: AttributeKey) -> Option<&str> {
        self.attributes.get(&key).map(|r| r.value.as_str())
    }

    pub fn source_of(&self, key: AttributeKey) -> Option<&str> {
        self.attributes.get(&key).map(|r| r.source_id.as_str())
    }
}

/// One published catalog line. Field order is the column order of the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CatalogRow {
    pub vehicle_id: String,
    pub title: String,
    pub description: String,
    pub make: String,
    pub model: String,
    pub year: String,
    pub link: String,
    pub image_link: String,
    pub exterior_color: String,
    pub trim: String,
    pub fuel_type: String,
    pub price: String,
    pub offer_type: String,
    pub amount_price: String,
    pub amount_qualifier: String,
    pub term_length: String,
    pub offer_term_qualifier: String,
    pub downpayment: String,
    pub downpayment_qualifier: String,
    pub offer_disclaimer: String,
    pub offer_disclaimer_url: String,
}

impl CatalogRow {
    /// Price and installment count as one requirement.
    pub fn missing_required(&self) -> Vec<&'static str> {
        missing_common(
            &self.vehicle_id,
            &self.title,
            &self.link,
            &self.price,
            &self.amount_price,
            &self.image_link,
        )
    }
}

impl FeedRow for CatalogRow {
    const COLUMNS: &'static [&'static str] = &CATALOG_COLUMNS;

    fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    fn missing_required(&self) -> Vec<&'static str> {
        CatalogRow::missing_required(self)
    }
}

/// One vehicle in stock, listed with its dealer location and monthly rate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InventoryRow {
    pub vehicle_id: String,
    pub title: String,
    pub description: String,
    pub link: String,
    pub image_link: String,
    pub make: String,
    pub model: String,
    pub year: String,
    #[serde(rename = "mileage.value")]
    pub mileage_value: String,
    #[serde(rename = "mileage.unit")]
    pub mileage_unit: String,
    pub body_style: String,
    pub exterior_color: String,
    pub state_of_vehicle: String,
    pub price: String,
    pub currency: String,
    /// Dealer address as a compact JSON object.
    pub address: String,
    pub latitude: String,
    pub longitude: String,
    pub offer_type: String,
    pub amount_price: String,
    pub amount_qualifier: String,
    pub fuel_type: String,
    pub transmission: String,
    pub drivetrain: String,
}

impl FeedRow for InventoryRow {
    const COLUMNS: &'static [&'static str] = &INVENTORY_COLUMNS;

    fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    fn missing_required(&self) -> Vec<&'static str> {
        missing_common(
            &self.vehicle_id,
            &self.title,
            &self.link,
            &self.price,
            &self.amount_price,
            &self.image_link,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishState {
    CandidateReady,
    Validating,
    Published,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    TooFewRows { count: usize, min_rows: usize },
    ExcessiveDrop { previous: usize, count: usize, drop_ratio: f64, limit: f64 },
    InvalidRows { problems: Vec<String> },
    Io { message: String },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::TooFewRows { count, min_rows } => {
                write!(f, "too few rows: {count} (minimum {min_rows})")
            }
            RejectionReason::ExcessiveDrop {
                previous,
                count,
                drop_ratio,
                limit,
            } => write!(
                f,
                "row count dropped {:.0}% ({previous} -> {count}), limit {:.0}%",
                drop_ratio * 100.0,
                limit * 100.0
            ),
            RejectionReason::InvalidRows { problems } => {
                write!(f, "{} invalid rows", problems.len())
            }
            RejectionReason::Io { message } => write!(f, "i/o failure: {message}"),
        }
    }
}

/// Outcome of one publish attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    pub accepted: bool,
    pub row_count: usize,
    pub previous_count: Option<usize>,
    pub drop_ratio: Option<f64>,
    pub rejection_reason: Option<RejectionReason>,
    pub warnings: Vec<String>,
    pub live_path: String,
    pub archive_path: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl PublishResult {
    pub fn state(&self) -> PublishState {
        if self.accepted {
            PublishState::Published
        } else {
            PublishState::Rejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_down_payment_needs_price() {
        let dp = DownPayment::Percent(10.0);
        assert_eq!(dp.resolve_amount(None), None);
        assert_eq!(dp.resolve_amount(Some(159_900.0)), Some(15_990));
        assert_eq!(DownPayment::Amount(5000.5).resolve_amount(None), Some(5000));
        assert_eq!(dp.to_string(), "10%");
    }

    #[test]
    fn variant_key_normalization_ignores_case_and_spacing() {
        let a = BaseVariant::new(" Tonale ", "Veloce", "Hybrid  160").with_color("Rosso Alfa");
        let b = BaseVariant::new("tonale", "VELOCE", "hybrid 160").with_color(" rosso alfa");
        assert_eq!(a.normalized(), b.normalized());
        assert_eq!(a.normalized(), "tonale|veloce|hybrid 160|rosso alfa");
    }

    #[test]
    fn missing_required_treats_price_and_installment_as_one_requirement() {
        let mut row = CatalogRow {
            vehicle_id: "ALFA-1".into(),
            title: "Tonale".into(),
            link: "https://example.test/tonale".into(),
            image_link: "https://example.test/tonale.jpg".into(),
            ..Default::default()
        };
        assert_eq!(row.missing_required(), vec!["price_or_installment"]);
        row.amount_price = "1299 PLN".into();
        assert!(row.missing_required().is_empty());
    }

    #[test]
    fn inventory_row_serializes_in_column_order() {
        let row = InventoryRow {
            vehicle_id: "VF3M4DGZUNS012345".into(),
            mileage_value: "0".into(),
            mileage_unit: "KM".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&row).unwrap();
        let keys: Vec<&str> = json
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        let mut expected = INVENTORY_COLUMNS.to_vec();
        expected.sort_unstable();
        let mut keys = keys;
        keys.sort_unstable();
        assert_eq!(keys, expected);
        assert_eq!(json["mileage.unit"], "KM");
        assert_eq!(
            FeedRow::missing_required(&row),
            vec!["title", "link", "price_or_installment", "image_link"]
        );
    }

    #[test]
    fn rejection_reason_serializes_with_kind_tag() {
        let reason = RejectionReason::TooFewRows { count: 3, min_rows: 5 };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "too_few_rows");
        assert_eq!(reason.to_string(), "too few rows: 3 (minimum 5)");
    }
}
