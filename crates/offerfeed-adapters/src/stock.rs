//! Dealer stock listings: the shop's product API records and the per-vehicle
//! detail pages behind them.

use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{fragment_text, json_str, parse_amount, selector, visible_text, AdapterError};

/// Category slugs that never name a model.
const UNCATEGORIZED: [&str; 2] = ["bez-kategorii", "uncategorized"];

/// One product record from the shop listing API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockListing {
    pub id: String,
    pub link: String,
    /// Rendered product title; a 17 character title is the VIN.
    pub title: String,
    pub classes: Vec<String>,
    pub description: String,
    pub image: Option<String>,
}

impl StockListing {
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        let id = match value.get("id")? {
            JsonValue::Number(n) => n.to_string(),
            JsonValue::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => return None,
        };
        let link = json_str(value, &["link"])?.trim().to_string();
        // WordPress serializes class_list as an object after array filters run.
        let classes = match value.get("class_list") {
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(ToString::to_string)
                .collect(),
            Some(JsonValue::Object(map)) => map
                .values()
                .filter_map(JsonValue::as_str)
                .map(ToString::to_string)
                .collect(),
            _ => Vec::new(),
        };
        let image = value
            .get("yoast_head_json")
            .and_then(|y| y.get("og_image"))
            .and_then(JsonValue::as_array)
            .and_then(|imgs| imgs.first())
            .and_then(|img| json_str(img, &["url"]))
            .map(ToString::to_string);

        Some(Self {
            id,
            link,
            title: json_str(value, &["title", "rendered"])
                .map(fragment_text)
                .unwrap_or_default(),
            classes,
            description: json_str(value, &["yoast_head_json", "description"])
                .unwrap_or_default()
                .to_string(),
            image,
        })
    }

    /// Records of one listing page. Anything but a JSON array is an empty page.
    pub fn parse_page(payload: &JsonValue) -> Vec<Self> {
        payload
            .as_array()
            .map(|items| items.iter().filter_map(Self::from_json).collect())
            .unwrap_or_default()
    }

    pub fn vin(&self) -> Option<&str> {
        let title = self.title.trim();
        (title.chars().count() == 17 && title.chars().all(|c| c.is_ascii_alphanumeric()))
            .then_some(title)
    }

    /// Gross price quoted in the SEO description, e.g. "... od 159 900 zł".
    pub fn description_price(&self) -> Option<f64> {
        first_price(&self.description, 1)
    }
}

/// Vehicle attributes encoded in a product's CSS classes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StockAttributes {
    pub model_slug: Option<String>,
    pub color: Option<String>,
    pub fuel_type: Option<&'static str>,
    pub transmission: Option<&'static str>,
    pub trim: Option<String>,
    pub year: Option<String>,
}

/// "czerwony-kardynalski" -> "Czerwony Kardynalski".
pub fn title_case_slug(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

impl StockAttributes {
    pub fn from_classes(classes: &[String]) -> Self {
        let mut attrs = StockAttributes::default();
        for class in classes {
            let class = class.trim();
            if let Some(slug) = class.strip_prefix("product_cat-") {
                if attrs.model_slug.is_none() && !UNCATEGORIZED.contains(&slug) {
                    attrs.model_slug = Some(slug.to_string());
                }
            } else if let Some(slug) = class.strip_prefix("pa_kolor-") {
                attrs.color = Some(title_case_slug(slug));
            } else if let Some(slug) = class.strip_prefix("pa_typ-paliwa-") {
                attrs.fuel_type = fuel_from_slug(slug);
            } else if let Some(slug) = class.strip_prefix("pa_typ-skrzyni-") {
                if slug.contains("automat") {
                    attrs.transmission = Some("Automatic");
                } else if slug.contains("manual") {
                    attrs.transmission = Some("Manual");
                }
            } else if let Some(slug) = class.strip_prefix("pa_poziom-wyposazenia-") {
                attrs.trim = Some(title_case_slug(slug));
            } else if let Some(year) = class.strip_prefix("pa_rok-produkcji-") {
                if year.len() == 4 && year.chars().all(|c| c.is_ascii_digit()) {
                    attrs.year = Some(year.to_string());
                }
            }
        }
        attrs
    }
}

fn fuel_from_slug(slug: &str) -> Option<&'static str> {
    if slug.contains("plug") {
        Some("Plug-in Hybrid")
    } else if slug.contains("hybryd") {
        Some("Hybrid")
    } else if slug.contains("elektryczn") {
        Some("Electric")
    } else if slug.contains("diesel") {
        Some("Diesel")
    } else if slug.contains("benzyn") {
        Some("Gasoline")
    } else {
        None
    }
}

/// What a single vehicle's detail page tells us.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StockDetail {
    pub price: Option<f64>,
    /// Net monthly business-lease installment.
    pub installment: Option<f64>,
    pub dealer_city: Option<String>,
    pub dealer_name: Option<String>,
    pub year: Option<String>,
}

/// Compiled patterns for detail pages.
#[derive(Debug, Clone)]
pub struct StockDetailParser {
    dealer_city: Regex,
    dealer_name: Regex,
    year: Regex,
    installment: Regex,
}

impl StockDetailParser {
    pub fn new() -> Result<Self, AdapterError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|err| AdapterError::Message(format!("invalid pattern {pattern}: {err}")))
        };
        Ok(Self {
            dealer_city: compile(r#""edealerCity"\s*:\s*"([^"]*)""#)?,
            dealer_name: compile(r#""edealerName"\s*:\s*"([^"]+)""#)?,
            year: compile(r"(?i)rok\s+produkcji\s*[:\-]?\s*(\d{4})")?,
            installment: compile(
                r"(?i)\brat[aąy]\w*(?:\s+\w+){0,4}?\s+(?:od\s+)?(\d[\d\s.,]*?)\s*(?:zł|pln)\s*netto",
            )?,
        })
    }

    pub fn parse(&self, html: &str) -> Result<StockDetail, AdapterError> {
        let document = Html::parse_document(html);
        let text = visible_text(&document);

        let price_tag = selector("p.price")?;
        let discounted = selector("ins")?;
        let price = document
            .select(&price_tag)
            .next()
            .map(|tag| match tag.select(&discounted).next() {
                Some(ins) => ins.text().collect::<String>(),
                None => tag.text().collect::<String>(),
            })
            .and_then(|raw| digits_amount(&raw))
            .or_else(|| first_price(&text, 5));

        let capture = |re: &Regex, haystack: &str| {
            re.captures(haystack)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(StockDetail {
            price,
            installment: capture(&self.installment, &text)
                .and_then(|raw| parse_amount(&raw))
                .filter(|v| *v > 0.0),
            dealer_city: capture(&self.dealer_city, html),
            dealer_name: capture(&self.dealer_name, html),
            year: capture(&self.year, &text),
        })
    }
}

fn digits_amount(raw: &str) -> Option<f64> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    digits.parse::<u64>().ok().filter(|v| *v > 0).map(|v| v as f64)
}

/// First "N zł" amount whose digits number at least `min_digits`; shorter runs are rates.
fn first_price(text: &str, min_digits: usize) -> Option<f64> {
    let mut rest = text;
    while let Some(pos) = rest.find("zł") {
        let before = rest[..pos].trim_end();
        let start = before
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit() || c.is_whitespace() || *c == '.' || *c == '\u{a0}')
            .last()
            .map(|(i, _)| i)
            .unwrap_or(before.len());
        let candidate = &before[start..];
        if candidate.chars().filter(char::is_ascii_digit).count() >= min_digits {
            if let Some(value) = digits_amount(candidate) {
                return Some(value);
            }
        }
        rest = &rest[pos + "zł".len()..];
    }
    None
}
