//! Stock-inventory feeds: one row per vehicle on a dealer shop, priced from
//! its detail page and located at its dealer.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use offerfeed_adapters::{
    format_amount, title_case_slug, StockAttributes, StockDetail, StockDetailParser, StockListing,
};
use offerfeed_core::{normalize_identity_part, InventoryRow};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{is_remote, load_input, FeedConfig, FeedPipeline, FeedRunReport};

const CURRENCY: &str = "PLN";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockSegment {
    #[default]
    All,
    Passenger,
    Commercial,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DealerLocation {
    pub city: String,
    pub street: String,
    pub region: String,
    pub latitude: String,
    pub longitude: String,
}

impl DealerLocation {
    /// Address column value: a compact JSON object in upper case.
    pub fn address_json(&self) -> String {
        serde_json::json!({
            "addr1": self.street.to_uppercase(),
            "city": self.city.to_uppercase(),
            "region": self.region.to_uppercase(),
            "country": "PL",
        })
        .to_string()
    }
}

fn default_max_items() -> usize {
    100
}

fn default_max_pages() -> usize {
    20
}

fn default_body_style() -> String {
    "SUV".to_string()
}

fn default_commercial_body_style() -> String {
    "Van".to_string()
}

fn default_transmission() -> String {
    "Manual".to_string()
}

fn default_drivetrain() -> String {
    "FWD".to_string()
}

fn default_city() -> String {
    "Warszawa".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StockConfig {
    /// Product listing endpoint, paged with `per_page`/`page`, or one local JSON page.
    pub listing: String,
    /// Local mirror of detail pages as `{id}.html`; the product link is fetched otherwise.
    #[serde(default)]
    pub detail_dir: Option<String>,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default)]
    pub segment: StockSegment,
    /// Category slugs (substring match) listed as commercial vehicles.
    #[serde(default)]
    pub commercial_categories: Vec<String>,
    /// Category slug to display name; unmapped slugs are title-cased.
    #[serde(default)]
    pub model_names: BTreeMap<String, String>,
    #[serde(default = "default_body_style")]
    pub body_style: String,
    #[serde(default = "default_commercial_body_style")]
    pub commercial_body_style: String,
    #[serde(default = "default_transmission")]
    pub default_transmission: String,
    #[serde(default = "default_drivetrain")]
    pub drivetrain: String,
    /// Gross price used when neither the detail page nor the listing quotes one.
    #[serde(default)]
    pub fallback_price: Option<f64>,
    #[serde(default)]
    pub dealers: Vec<DealerLocation>,
    #[serde(default = "default_city")]
    pub default_city: String,
}

impl StockConfig {
    pub fn model_name(&self, slug: &str) -> String {
        self.model_names
            .get(slug)
            .cloned()
            .unwrap_or_else(|| title_case_slug(slug))
    }

    pub fn is_commercial(&self, slug: &str) -> bool {
        self.commercial_categories
            .iter()
            .any(|c| !c.is_empty() && slug.contains(c.as_str()))
    }

    /// Known city from the page, a city named inside the dealer name, or the default.
    pub fn dealer_city(&self, detail: &StockDetail) -> String {
        if let Some(city) = &detail.dealer_city {
            return city.clone();
        }
        if let Some(name) = &detail.dealer_name {
            let name = name.to_uppercase();
            if let Some(dealer) = self
                .dealers
                .iter()
                .find(|d| name.contains(&d.city.to_uppercase()))
            {
                return dealer.city.clone();
            }
        }
        self.default_city.clone()
    }

    pub fn dealer(&self, city: &str) -> Option<&DealerLocation> {
        let wanted = normalize_identity_part(city);
        let fallback = normalize_identity_part(&self.default_city);
        self.dealers
            .iter()
            .find(|d| normalize_identity_part(&d.city) == wanted)
            .or_else(|| {
                self.dealers
                    .iter()
                    .find(|d| normalize_identity_part(&d.city) == fallback)
            })
    }
}

/// "{model} {trim} · od {rate} PLN/mies."
pub fn format_inventory_title(model: &str, trim: &str, installment: Option<&str>) -> String {
    let base = format!("{model} {trim}").trim().to_string();
    match installment {
        Some(rate) => format!("{base} · od {rate} {CURRENCY}/mies."),
        None => base,
    }
}

/// "Nowy {make} {model} {trim} · Rata od {rate} PLN netto/mies. · Leasing B2B · {city} · Sprawdź ofertę!"
pub fn format_inventory_description(
    make: &str,
    model: &str,
    trim: &str,
    installment: Option<&str>,
    city: &str,
) -> String {
    let full_name = format!("{make} {model} {trim}").trim().to_string();
    let mut parts = vec![format!("Nowy {full_name}")];
    if let Some(rate) = installment {
        parts.push(format!("Rata od {rate} {CURRENCY} netto/mies."));
    }
    parts.push("Leasing B2B".to_string());
    if !city.trim().is_empty() {
        parts.push(city.trim().to_string());
    }
    parts.push("Sprawdź ofertę!".to_string());
    parts.join(" · ")
}

/// Outcome of one listed vehicle.
#[derive(Debug)]
enum StockItem {
    Row(Box<InventoryRow>),
    Skipped(String),
}

/// Everything one vehicle needs besides its detail page.
struct StockContext {
    make: String,
    year: String,
    id_prefix: String,
    stock: Arc<StockConfig>,
}

impl StockContext {
    fn build_row(&self, listing: &StockListing, attrs: &StockAttributes, model_slug: &str, detail: &StockDetail) -> StockItem {
        let Some(rate) = detail.installment.filter(|v| *v > 0.0) else {
            return StockItem::Skipped(format!("{}: no business-lease installment", listing.id));
        };
        let rate = format_amount(rate);
        let model = self.stock.model_name(model_slug);
        let trim = attrs.trim.clone().unwrap_or_default();
        let city = self.stock.dealer_city(detail);
        let dealer = self.stock.dealer(&city);
        let price = detail
            .price
            .or_else(|| listing.description_price())
            .or(self.stock.fallback_price);

        let row = InventoryRow {
            vehicle_id: listing
                .vin()
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("{}-{}", self.id_prefix.to_uppercase(), listing.id)),
            title: format_inventory_title(&model, &trim, Some(&rate)),
            description: format_inventory_description(&self.make, &model, &trim, Some(&rate), &city),
            link: listing.link.clone(),
            image_link: listing.image.clone().unwrap_or_default(),
            make: self.make.clone(),
            model: model.clone(),
            year: detail
                .year
                .clone()
                .or_else(|| attrs.year.clone())
                .unwrap_or_else(|| self.year.clone()),
            mileage_value: "0".to_string(),
            mileage_unit: "KM".to_string(),
            body_style: if self.stock.is_commercial(model_slug) {
                self.stock.commercial_body_style.clone()
            } else {
                self.stock.body_style.clone()
            },
            exterior_color: attrs.color.clone().unwrap_or_else(|| "Standard".to_string()),
            state_of_vehicle: "New".to_string(),
            price: price
                .map(|p| format!("{} {CURRENCY}", format_amount(p)))
                .unwrap_or_default(),
            currency: CURRENCY.to_string(),
            address: dealer.map(DealerLocation::address_json).unwrap_or_default(),
            latitude: dealer.map(|d| d.latitude.clone()).unwrap_or_default(),
            longitude: dealer.map(|d| d.longitude.clone()).unwrap_or_default(),
            offer_type: "LEASE".to_string(),
            amount_price: format!("{rate} {CURRENCY}"),
            amount_qualifier: "per month".to_string(),
            fuel_type: attrs.fuel_type.unwrap_or("Gasoline").to_string(),
            transmission: attrs
                .transmission
                .map(ToString::to_string)
                .unwrap_or_else(|| self.stock.default_transmission.clone()),
            drivetrain: self.stock.drivetrain.clone(),
        };
        StockItem::Row(Box::new(row))
    }
}

impl FeedPipeline {
    pub(crate) async fn run_stock_feed(&self, feed: &FeedConfig, mut report: FeedRunReport) -> Result<FeedRunReport> {
        let Some(stock) = feed.stock.clone() else {
            bail!("stock feed {} has no stock section", feed.feed_id);
        };
        let stock = Arc::new(stock);
        let listings = self.load_listings(feed, &stock, &mut report).await?;
        let parser = Arc::new(StockDetailParser::new().context("compiling detail page patterns")?);
        let context = Arc::new(StockContext {
            make: feed.make.clone(),
            year: feed.year.clone(),
            id_prefix: feed.id_prefix.clone(),
            stock: Arc::clone(&stock),
        });

        let mut set = JoinSet::new();
        for listing in listings.into_iter().take(stock.max_items) {
            let attrs = StockAttributes::from_classes(&listing.classes);
            let Some(model_slug) = attrs.model_slug.clone() else {
                report.skipped_items.push(format!("{}: no model category", listing.id));
                continue;
            };
            let commercial = stock.is_commercial(&model_slug);
            let wanted = match stock.segment {
                StockSegment::All => true,
                StockSegment::Passenger => !commercial,
                StockSegment::Commercial => commercial,
            };
            if !wanted {
                continue;
            }

            let fetcher = Arc::clone(&self.fetcher);
            let root = self.config.workspace_root.clone();
            let parser = Arc::clone(&parser);
            let context = Arc::clone(&context);
            let source_id = format!("{}:detail", feed.feed_id);
            let reference = match &stock.detail_dir {
                Some(dir) => format!("{}/{}.html", dir.trim_end_matches('/'), listing.id),
                None => listing.link.clone(),
            };
            // The fetcher's global and per-source semaphores bound these tasks.
            set.spawn(async move {
                let html = match load_input(&fetcher, &root, &source_id, &reference).await {
                    Ok(html) => html,
                    Err(err) => {
                        warn!(item = %listing.id, error = %format!("{err:#}"), "detail page unavailable");
                        return Err(format!("{} detail: {err:#}", listing.id));
                    }
                };
                let detail = parser
                    .parse(&html)
                    .map_err(|err| format!("{} detail: {err}", listing.id))?;
                debug!(item = %listing.id, ?detail, "detail page parsed");
                Ok::<_, String>(context.build_row(&listing, &attrs, &model_slug, &detail))
            });
        }

        let mut rows = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(StockItem::Row(row))) => rows.push(*row),
                Ok(Ok(StockItem::Skipped(reason))) => report.skipped_items.push(reason),
                Ok(Err(failure)) => report.fetch_failures.push(failure),
                Err(err) => error!(error = %err, "detail task failed"),
            }
        }
        report.skipped_items.sort();
        report.fetch_failures.sort();
        info!(
            rows = rows.len(),
            skipped = report.skipped_items.len(),
            failures = report.fetch_failures.len(),
            "stock assembled"
        );

        report.candidate_rows = rows.len();
        let root = &self.config.workspace_root;
        let gate = self.gate.with_config(feed.gate_config(root));
        report.publish = Some(gate.publish(rows, &root.join(&feed.output)).await);
        Ok(report)
    }

    /// Every listing page until an empty one. A local listing is a single page.
    async fn load_listings(
        &self,
        feed: &FeedConfig,
        stock: &StockConfig,
        report: &mut FeedRunReport,
    ) -> Result<Vec<StockListing>> {
        let root = &self.config.workspace_root;
        let source_id = format!("{}:listing", feed.feed_id);
        if !is_remote(&stock.listing) {
            let text = load_input(&self.fetcher, root, &source_id, &stock.listing).await?;
            let payload: JsonValue = serde_json::from_str(&text)
                .with_context(|| format!("parsing listing {}", stock.listing))?;
            return Ok(StockListing::parse_page(&payload));
        }

        let separator = if stock.listing.contains('?') { '&' } else { '?' };
        let mut listings = Vec::new();
        for page in 1..=stock.max_pages.max(1) {
            let url = format!("{}{separator}per_page=100&page={page}", stock.listing);
            let payload = match self.fetcher.fetch_json(&source_id, &url).await {
                Ok(payload) => payload,
                Err(err) if page == 1 => {
                    return Err(err).with_context(|| format!("fetching listing {url}"));
                }
                // Past the last page the shop answers 400 instead of an empty array.
                Err(err) => {
                    debug!(page, error = %err, "listing pages exhausted");
                    break;
                }
            };
            let batch = StockListing::parse_page(&payload);
            if batch.is_empty() {
                break;
            }
            info!(page, items = batch.len(), "listing page fetched");
            listings.extend(batch);
            if listings.len() >= stock.max_items {
                break;
            }
        }
        if listings.is_empty() {
            report.fetch_failures.push(format!("listing {}: no products", stock.listing));
        }
        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warszawa() -> DealerLocation {
        DealerLocation {
            city: "Warszawa".into(),
            street: "Al. Krakowska 206".into(),
            region: "Mazowieckie".into(),
            latitude: "52.2084".into(),
            longitude: "20.9412".into(),
        }
    }

    #[test]
    fn titles_and_descriptions_follow_the_stock_format() {
        assert_eq!(
            format_inventory_title("Grandland", "Gs", Some("1899")),
            "Grandland Gs · od 1899 PLN/mies."
        );
        assert_eq!(format_inventory_title("Corsa", "", None), "Corsa");
        assert_eq!(
            format_inventory_description("Opel", "Grandland", "", Some("1899"), "Kraków"),
            "Nowy Opel Grandland · Rata od 1899 PLN netto/mies. · Leasing B2B · Kraków · Sprawdź ofertę!"
        );
        assert_eq!(
            format_inventory_description("Opel", "Corsa", "Edition", None, ""),
            "Nowy Opel Corsa Edition · Leasing B2B · Sprawdź ofertę!"
        );
    }

    #[test]
    fn dealer_address_is_upper_case_json() {
        let address: JsonValue = serde_json::from_str(&warszawa().address_json()).expect("json");
        assert_eq!(address["addr1"], "AL. KRAKOWSKA 206");
        assert_eq!(address["region"], "MAZOWIECKIE");
        assert_eq!(address["country"], "PL");
    }

    #[test]
    fn dealer_city_falls_back_through_name_then_default() {
        let stock: StockConfig = serde_yaml::from_str(
            r#"
listing: products.json
dealers:
  - { city: Warszawa, street: Al. Krakowska 206, region: Mazowieckie, latitude: "52.2084", longitude: "20.9412" }
  - { city: Wrocław, street: ul. Szczecińska 7, region: Dolnośląskie, latitude: "51.1274", longitude: "16.9535" }
"#,
        )
        .expect("yaml");
        let named = StockDetail {
            dealer_name: Some("Opel Auto Park Wrocław".into()),
            ..Default::default()
        };
        assert_eq!(stock.dealer_city(&named), "Wrocław");
        assert_eq!(stock.dealer_city(&StockDetail::default()), "Warszawa");
        assert_eq!(stock.dealer("Gdańsk").map(|d| d.city.as_str()), Some("Warszawa"));
        assert_eq!(stock.max_items, 100);
        assert_eq!(stock.segment, StockSegment::All);
        assert_eq!(stock.model_name("grandland-x"), "Grandland X");
    }

    #[test]
    fn vehicles_without_an_installment_are_skipped() {
        let context = StockContext {
            make: "Opel".into(),
            year: "2024".into(),
            id_prefix: "opel".into(),
            stock: Arc::new(
                serde_yaml::from_str::<StockConfig>("listing: products.json\nfallback_price: 150000\n")
                    .expect("yaml"),
            ),
        };
        let listing = StockListing {
            id: "77".into(),
            link: "https://sklep.opel.example/produkt/77".into(),
            title: "Corsa".into(),
            classes: Vec::new(),
            description: String::new(),
            image: None,
        };
        let attrs = StockAttributes::default();
        let skipped = context.build_row(&listing, &attrs, "corsa", &StockDetail::default());
        assert!(matches!(skipped, StockItem::Skipped(ref reason) if reason.starts_with("77:")));

        let detail = StockDetail {
            installment: Some(999.0),
            ..Default::default()
        };
        let StockItem::Row(row) = context.build_row(&listing, &attrs, "corsa", &detail) else {
            panic!("row expected");
        };
        assert_eq!(row.vehicle_id, "OPEL-77");
        assert_eq!(row.price, "150000 PLN");
        assert_eq!(row.year, "2024");
        assert_eq!(row.exterior_color, "Standard");
        assert_eq!(row.transmission, "Manual");
        assert_eq!(row.address, "");
    }
}
