use offerfeed_adapters::{format_amount, parse_amount};
use offerfeed_core::{AttributeKey, CatalogRow, Variant};

const CURRENCY: &str = "PLN";

/// Turns reconciled variants into catalog lines for one feed.
#[derive(Debug, Clone)]
pub struct RowBuilder {
    pub make: String,
    pub year: String,
    pub default_trim: String,
    pub default_disclaimer: String,
}

impl RowBuilder {
    pub fn model_name(&self, model: &str) -> String {
        let model = model.trim();
        if model.to_lowercase().starts_with(&self.make.to_lowercase()) {
            model.to_string()
        } else {
            format!("{} {model}", self.make)
        }
    }

    fn display_name(&self, variant: &Variant) -> String {
        let model = self.model_name(&variant.key.model);
        let trim = variant.key.trim.trim();
        if trim.is_empty() || trim.eq_ignore_ascii_case(&self.default_trim) {
            model
        } else {
            format!("{model} {trim}")
        }
    }

    /// Leasing offers when an installment is known, cash offers otherwise. `vehicle_id` is left blank.
    pub fn build(&self, variant: &Variant) -> CatalogRow {
        let value = |key: AttributeKey| variant.value(key).unwrap_or_default().to_string();
        let name = self.display_name(variant);
        let price = variant.value(AttributeKey::Price).and_then(parse_amount);
        let installment = variant.value(AttributeKey::Installment).and_then(parse_amount);
        let link = value(AttributeKey::Link);

        let mut row = CatalogRow {
            make: self.make.clone(),
            model: self.model_name(&variant.key.model),
            year: self.year.clone(),
            link: link.clone(),
            image_link: value(AttributeKey::Image),
            exterior_color: variant.key.color.clone(),
            trim: variant.key.trim.clone(),
            fuel_type: variant.key.powertrain.clone(),
            price: price
                .map(|p| format!("{} {CURRENCY}", format_amount(p)))
                .unwrap_or_default(),
            offer_disclaimer: variant
                .value(AttributeKey::Disclaimer)
                .map(ToString::to_string)
                .unwrap_or_else(|| self.default_disclaimer.clone()),
            offer_disclaimer_url: link,
            ..Default::default()
        };

        match (installment, price) {
            (Some(rate), _) => {
                let rate = format_amount(rate);
                row.title = format!("{name} · od {rate} {CURRENCY}/mies.");
                row.description = format!(
                    "Nowy {name} · Rata od {rate} {CURRENCY} netto/mies. · Leasing B2B · Sprawdź ofertę!"
                );
                row.offer_type = "LEASE".to_string();
                row.amount_price = format!("{rate} {CURRENCY}");
                row.amount_qualifier = "per month".to_string();
                if let Some(months) = variant.value(AttributeKey::TermMonths) {
                    row.term_length = months.to_string();
                    row.offer_term_qualifier = "months".to_string();
                }
                if let Some(down) = variant
                    .value(AttributeKey::DownPayment)
                    .and_then(|d| down_payment_amount(d, price))
                {
                    row.downpayment = format!("{} {CURRENCY}", format_amount(down));
                    row.downpayment_qualifier = "due at signing".to_string();
                }
            }
            (None, Some(total)) => {
                let total = format_amount(total);
                row.title = format!("{name} · od {total} {CURRENCY}");
                let engine = variant.value(AttributeKey::Powertrain).unwrap_or(variant.key.powertrain.as_str());
                row.description = if engine.trim().is_empty() {
                    format!("Nowy {name} · Dowiedz się więcej!")
                } else {
                    format!("Nowy {name} · {engine} · Dowiedz się więcej!")
                };
                row.offer_type = "CASH".to_string();
                row.amount_price = format!("{total} {CURRENCY}");
                row.amount_qualifier = "Total".to_string();
            }
            (None, None) => {
                row.title = name;
            }
        }

        row
    }
}

/// Percentages resolve against the gross price, truncated to whole units.
fn down_payment_amount(raw: &str, price: Option<f64>) -> Option<f64> {
    let raw = raw.trim();
    let amount = match raw.strip_suffix('%') {
        Some(pct) => {
            let pct = parse_amount(pct)?;
            price.map(|p| (p * pct / 100.0).trunc())
        }
        None => parse_amount(raw),
    };
    amount.filter(|v| *v > 0.0)
}
