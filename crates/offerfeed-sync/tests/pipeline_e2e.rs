use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use offerfeed_core::RejectionReason;
use offerfeed_storage::{read_catalog_rows, Alerter, MemoryAlerter};
use offerfeed_sync::{report_recent_markdown, FeedPipeline, SyncConfig, SyncRunSummary};

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
        .join("fixtures")
}

fn registry(fixtures: &Path) -> String {
    let f = |relative: &str| fixtures.join(relative).display().to_string();
    format!(
        r#"
feeds:
  - feed_id: alfa
    make: Alfa Romeo
    year: "2025"
    id_prefix: alfa
    output: output/alfa.csv
    default_powertrain: Hybrid
    templates: [financing_disclaimer]
    models:
      - model: Tonale
        link: https://www.alfaromeo.example/modele/tonale
        page: "{alfa}"
        trims: [Sprint, Ti, Veloce]
  - feed_id: opel
    make: Opel
    year: "2025"
    id_prefix: OPEL
    output: output/opel.csv
    inventory: "{inventory}"
    models:
      - model: Astra
        link: https://www.opel.example/samochody/astra
        page: "{opel_page}"
        config_api: "{opel_api}"
        render_url_template: "https://visual3d.example/render?version={{lcdv}}&color={{color}}"
  - feed_id: ds
    make: DS
    year: "2025"
    id_prefix: DS
    output: output/ds.csv
    models:
      - model: DS 7
        link: https://www.dsautomobiles.example/modele/ds7.html
        page: "{ds}"
        powertrain: Plug-in Hybrid
  - feed_id: paused
    enabled: false
    make: Opel
    year: "2025"
    id_prefix: OPEL
    output: output/paused.csv
    models: []
"#,
        alfa = f("alfa/tonale/page.html"),
        inventory = f("opel/inventory.csv"),
        opel_page = f("opel/astra/page.html"),
        opel_api = f("opel/astra/versions.json"),
        ds = f("ds/ds7/page.html"),
    )
}

fn ids_by_key(rows: &[BTreeMap<String, String>]) -> BTreeMap<(String, String, String, String), String> {
    rows.iter()
        .map(|row| {
            let col = |name: &str| row.get(name).cloned().unwrap_or_default();
            (
                (col("model"), col("trim"), col("fuel_type"), col("exterior_color")),
                col("vehicle_id"),
            )
        })
        .collect()
}

fn feed<'a>(summary: &'a SyncRunSummary, feed_id: &str) -> &'a offerfeed_sync::FeedRunReport {
    summary
        .feeds
        .iter()
        .find(|f| f.feed_id == feed_id)
        .expect("feed present")
}

#[tokio::test]
async fn sync_publishes_stable_catalogs_and_holds_back_thin_feeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    std::fs::write(root.join("feeds.yaml"), registry(&fixtures_root())).expect("write registry");

    let alerter = Arc::new(MemoryAlerter::default());
    let pipeline = FeedPipeline::new(
        SyncConfig::for_workspace(root),
        alerter.clone() as Arc<dyn Alerter>,
    )
    .expect("pipeline");

    let first = pipeline.run_once().await.expect("first run");
    assert_eq!(first.feeds.len(), 3);
    assert_eq!(first.published_feeds(), 2);

    let alfa = feed(&first, "alfa");
    assert!(alfa.published());
    assert_eq!(alfa.candidate_rows, 9);
    assert_eq!(alfa.extractions[0].template.as_deref(), Some("financing_disclaimer"));
    assert_eq!(alfa.extractions[0].offers, 3);

    let opel = feed(&first, "opel");
    assert!(opel.published());
    assert_eq!(opel.candidate_rows, 6);
    assert!(opel.exclusions.is_empty());

    let ds = feed(&first, "ds");
    let ds_publish = ds.publish.as_ref().expect("ds decision");
    assert!(!ds_publish.accepted);
    assert_eq!(
        ds_publish.rejection_reason,
        Some(RejectionReason::TooFewRows { count: 3, min_rows: 5 })
    );
    assert!(!root.join("output/ds.csv").exists());
    assert!(alerter
        .alerts()
        .iter()
        .any(|a| a.topic == "Data Threshold Error"));

    let alfa_rows = read_catalog_rows(&root.join("output/alfa.csv")).await.expect("alfa csv");
    assert_eq!(alfa_rows.len(), 9);
    assert!(alfa_rows.iter().all(|r| r["vehicle_id"].starts_with("ALFA-")));
    let veloce_rosso = alfa_rows
        .iter()
        .find(|r| r["trim"] == "Veloce" && r["exterior_color"] == "Rosso Alfa")
        .expect("veloce row");
    assert_eq!(veloce_rosso["offer_type"], "LEASE");
    assert_eq!(veloce_rosso["amount_price"], "1599 PLN");
    assert_eq!(veloce_rosso["term_length"], "48");
    assert_eq!(veloce_rosso["downpayment"], "37980 PLN");
    assert_eq!(veloce_rosso["price"], "189900 PLN");
    assert_eq!(veloce_rosso["offer_disclaimer"], "Szczegóły u dealera Alfa Romeo.");
    assert_eq!(
        veloce_rosso["image_link"],
        "https://www.alfaromeo.example/content/dam/tonale/rosso-alfa.png"
    );
    let sprint = alfa_rows
        .iter()
        .find(|r| r["trim"] == "Sprint")
        .expect("sprint row");
    assert_eq!(sprint["offer_disclaimer"], "Oferta ważna do 31.12.2025 r.");
    assert_eq!(sprint["fuel_type"], "Hybrid");

    let opel_rows = read_catalog_rows(&root.join("output/opel.csv")).await.expect("opel csv");
    let electric: Vec<_> = opel_rows
        .iter()
        .filter(|r| r["fuel_type"] == "Electric")
        .collect();
    assert_eq!(electric.len(), 2);
    assert!(electric
        .iter()
        .any(|r| r["image_link"] == "https://cdn.example/inventory/astra-red.jpg"));
    assert!(electric.iter().all(|r| r["offer_type"] == "CASH"));
    let edition = opel_rows
        .iter()
        .find(|r| r["trim"] == "Edition" && r["exterior_color"] == "Szary Kwarcowy")
        .expect("edition row");
    assert_eq!(edition["price"], "109900 PLN");
    assert_eq!(edition["image_link"], "https://cdn.example/swatch/szary.png");

    let first_reports = PathBuf::from(&first.reports_dir);
    assert!(first_reports.join("run_summary.json").exists());
    let brief = std::fs::read_to_string(first_reports.join("daily_brief.md")).expect("brief");
    assert!(brief.contains("## ds"));
    assert!(brief.contains("rejected (too few rows: 3 (minimum 5))"));

    let second = pipeline.run_once().await.expect("second run");
    assert_ne!(first.run_id, second.run_id);
    let alfa_again = feed(&second, "alfa").publish.as_ref().expect("alfa decision");
    assert!(alfa_again.accepted);
    assert_eq!(alfa_again.previous_count, Some(9));
    assert_eq!(alfa_again.drop_ratio, Some(0.0));
    let archived = PathBuf::from(alfa_again.archive_path.as_ref().expect("archive path"));
    assert!(archived.exists());

    let alfa_rows_again = read_catalog_rows(&root.join("output/alfa.csv")).await.expect("alfa csv");
    assert_eq!(ids_by_key(&alfa_rows), ids_by_key(&alfa_rows_again));
    let opel_rows_again = read_catalog_rows(&root.join("output/opel.csv")).await.expect("opel csv");
    assert_eq!(ids_by_key(&opel_rows), ids_by_key(&opel_rows_again));

    let digest = report_recent_markdown(5, &root.join("reports")).expect("digest");
    assert_eq!(digest.matches("## Run").count(), 2);
    assert!(digest.contains("- published: 2"));
    assert!(digest.contains("- rejected: 1"));
}

#[tokio::test]
async fn missing_inputs_are_reported_without_failing_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    std::fs::write(
        root.join("feeds.yaml"),
        r#"
feeds:
  - feed_id: broken
    make: Fiat
    year: "2025"
    id_prefix: FIAT
    output: output/fiat.csv
    inventory: missing/inventory.csv
    models:
      - model: "600"
        link: https://www.fiat.example/600
        page: missing/page.html
"#,
    )
    .expect("write registry");

    let pipeline = FeedPipeline::new(
        SyncConfig::for_workspace(root),
        Arc::new(MemoryAlerter::default()) as Arc<dyn Alerter>,
    )
    .expect("pipeline");
    let summary = pipeline.run_once().await.expect("run");
    let broken = feed(&summary, "broken");
    assert!(broken.error.is_none());
    assert_eq!(broken.fetch_failures.len(), 2);
    assert_eq!(broken.candidate_rows, 0);
    assert!(!broken.published());
    assert!(!root.join("output/fiat.csv").exists());
}

async fn run_registry(root: &Path, registry: &str) -> SyncRunSummary {
    std::fs::write(root.join("feeds.yaml"), registry).expect("write registry");
    FeedPipeline::new(
        SyncConfig::for_workspace(root),
        Arc::new(MemoryAlerter::default()) as Arc<dyn Alerter>,
    )
    .expect("pipeline")
    .run_once()
    .await
    .expect("run")
}

#[tokio::test]
async fn same_trim_with_two_engines_publishes_both() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    std::fs::write(
        root.join("tonale_legal.txt"),
        "Przykładowa kalkulacja dla modelu Tonale 1.5 Hybrid 160 KM Veloce: cena katalogowa brutto 189 900 zł, \
         okres leasingu 48 mies., wpłata początkowa 20%, miesięczna rata leasingowa netto: 1 599 zł. \
         Przykładowa kalkulacja dla modelu Tonale 1.3 PHEV 280 KM Q4 Veloce: cena katalogowa brutto 229 900 zł, \
         okres leasingu 48 mies., wpłata początkowa 20%, miesięczna rata leasingowa netto: 2 199 zł.",
    )
    .expect("legal text");
    let registry = format!(
        r#"
feeds:
  - feed_id: tonale
    make: Alfa Romeo
    year: "2025"
    id_prefix: ALFA
    output: output/tonale.csv
    gate: {{ min_rows: 1 }}
    templates: [financing_disclaimer]
    models:
      - model: Tonale
        link: https://www.alfaromeo.example/modele/tonale
        page: "{page}"
        legal: tonale_legal.txt
        trims: [Veloce]
"#,
        page = fixtures_root().join("alfa/tonale/page.html").display(),
    );

    let summary = run_registry(root, &registry).await;
    let tonale = feed(&summary, "tonale");
    assert!(tonale.published(), "{:?}", tonale.publish);
    assert_eq!(tonale.extractions[0].offers, 2);
    assert_eq!(tonale.extractions[0].base_variants, 2);

    let rows = read_catalog_rows(&root.join("output/tonale.csv")).await.expect("csv");
    assert_eq!(rows.len(), 6);
    let rate_by_fuel: BTreeMap<String, String> = rows
        .iter()
        .map(|r| (r["fuel_type"].clone(), r["amount_price"].clone()))
        .collect();
    assert_eq!(rate_by_fuel.len(), 2);
    assert_eq!(rate_by_fuel["Hybrid"], "1599 PLN");
    assert_eq!(rate_by_fuel["Plug-in Hybrid"], "2199 PLN");
    assert!(rows.iter().all(|r| r["trim"] == "Veloce"));
    assert_eq!(ids_by_key(&rows).len(), 6);
}

#[tokio::test]
async fn model_default_trim_stays_out_of_titles() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    let registry = format!(
        r#"
feeds:
  - feed_id: ds
    make: DS
    year: "2025"
    id_prefix: DS
    output: output/ds.csv
    gate: {{ min_rows: 1 }}
    models:
      - model: DS 7
        link: https://www.dsautomobiles.example/modele/ds7.html
        page: "{page}"
        powertrain: Plug-in Hybrid
        default_trim: Base
"#,
        page = fixtures_root().join("ds/ds7/page.html").display(),
    );

    let summary = run_registry(root, &registry).await;
    assert!(feed(&summary, "ds").published());
    let rows = read_catalog_rows(&root.join("output/ds.csv")).await.expect("csv");
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row["trim"], "Base");
        assert!(row["title"].starts_with("DS 7 · od "), "{}", row["title"]);
        assert!(!row["title"].contains("Base"));
        assert!(!row["description"].contains("Base"));
    }
}

fn stock_registry(fixtures: &Path) -> String {
    let listing = fixtures.join("opel/stock/products.json").display().to_string();
    let detail_dir = fixtures.join("opel/stock").display().to_string();
    let feed = |feed_id: &str, output: &str, segment: &str| {
        format!(
            r#"
  - feed_id: {feed_id}
    kind: stock
    make: Opel
    year: "2024"
    id_prefix: opel
    output: {output}
    gate: {{ min_rows: 1 }}
    stock:
      listing: "{listing}"
      detail_dir: "{detail_dir}"
      segment: {segment}
      commercial_categories: [combo-cargo, movano, vivaro]
      fallback_price: 150000
      dealers:
        - {{ city: Warszawa, street: Al. Krakowska 206, region: Mazowieckie, latitude: "52.2084", longitude: "20.9412" }}
        - {{ city: Kraków, street: ul. Opolska 9, region: Małopolskie, latitude: "50.0931", longitude: "19.9238" }}
        - {{ city: Wrocław, street: ul. Szczecińska 7, region: Dolnośląskie, latitude: "51.1274", longitude: "16.9535" }}
"#
        )
    };
    format!(
        "feeds:{}{}",
        feed("opel-stock", "output/opel_stock.csv", "passenger"),
        feed("opel-stock-commercial", "output/opel_stock_commercial.csv", "commercial"),
    )
}

#[tokio::test]
async fn stock_feeds_publish_one_row_per_financed_vehicle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    let summary = run_registry(root, &stock_registry(&fixtures_root())).await;
    assert_eq!(summary.published_feeds(), 2);

    let passenger = feed(&summary, "opel-stock");
    assert_eq!(passenger.candidate_rows, 1);
    assert_eq!(
        passenger.skipped_items,
        vec![
            "103: no business-lease installment".to_string(),
            "104: no model category".to_string()
        ]
    );
    assert!(passenger.fetch_failures.is_empty());

    let live = root.join("output/opel_stock.csv");
    let report = offerfeed_storage::validate_catalog_file(&live).await.expect("validate");
    assert!(report.is_valid(), "{:?}", report.errors);
    let rows = read_catalog_rows(&live).await.expect("csv");
    let grandland = &rows[0];
    assert_eq!(grandland["vehicle_id"], "VXKUHZKXZR4123456");
    assert_eq!(grandland["title"], "Grandland Gs · od 1899 PLN/mies.");
    assert_eq!(
        grandland["description"],
        "Nowy Opel Grandland Gs · Rata od 1899 PLN netto/mies. · Leasing B2B · Kraków · Sprawdź ofertę!"
    );
    assert_eq!(grandland["price"], "154900 PLN");
    assert_eq!(grandland["amount_price"], "1899 PLN");
    assert_eq!(grandland["amount_qualifier"], "per month");
    assert_eq!(grandland["offer_type"], "LEASE");
    assert_eq!(grandland["year"], "2025");
    assert_eq!(grandland["body_style"], "SUV");
    assert_eq!(grandland["fuel_type"], "Hybrid");
    assert_eq!(grandland["transmission"], "Automatic");
    assert_eq!(grandland["exterior_color"], "Czerwony Kardynalski");
    assert_eq!(grandland["latitude"], "50.0931");
    assert_eq!(grandland["mileage.value"], "0");
    let address: serde_json::Value = serde_json::from_str(&grandland["address"]).expect("address json");
    assert_eq!(address["city"], "KRAKÓW");
    assert_eq!(address["addr1"], "UL. OPOLSKA 9");

    let commercial = feed(&summary, "opel-stock-commercial");
    assert_eq!(commercial.candidate_rows, 1);
    let rows = read_catalog_rows(&root.join("output/opel_stock_commercial.csv"))
        .await
        .expect("csv");
    let combo = &rows[0];
    assert_eq!(combo["vehicle_id"], "OPEL-102");
    assert_eq!(combo["model"], "Combo Cargo");
    assert_eq!(combo["body_style"], "Van");
    assert_eq!(combo["fuel_type"], "Electric");
    assert_eq!(combo["price"], "139900 PLN");
    assert_eq!(combo["amount_price"], "1499 PLN");
    assert_eq!(combo["year"], "2024");
    assert_eq!(combo["longitude"], "16.9535");
    assert!(combo["description"].contains(" · Wrocław · "));
}

#[tokio::test]
async fn stock_feed_without_listing_fails_alone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    let summary = run_registry(
        root,
        r#"
feeds:
  - feed_id: ds-stock
    kind: stock
    make: DS Automobiles
    year: "2024"
    id_prefix: DS
    output: output/ds_stock.csv
    stock:
      listing: missing/products.json
"#,
    )
    .await;
    let ds = feed(&summary, "ds-stock");
    assert!(ds.error.as_deref().unwrap_or_default().contains("missing/products.json"));
    assert!(ds.publish.is_none());
    assert!(!root.join("output/ds_stock.csv").exists());
}
