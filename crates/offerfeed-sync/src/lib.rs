//! Feed orchestration: load inputs, extract offers, reconcile sources, assign
//! identifiers and publish each feed through the gate.

pub mod identity;
pub mod reconcile;
pub mod rows;
pub mod stock;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use offerfeed_adapters::{
    AttributeSource, ConfigApiSource, EmbeddedPage, Extraction, InventorySource, PageEmbeddedSource,
    PageOffer, StaticSource, TemplateRegistry, TrimCatalog, TrimCatalogs,
};
use offerfeed_core::{normalize_identity_part, AttributeKey, AttributeMap, BaseVariant, PublishResult};
use offerfeed_storage::{
    build_alerter, AlertConfig, Alerter, GateConfig, HttpClientConfig, HttpFetcher, PublishGate,
    RetryPolicy,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use identity::IdentityAssigner;
pub use reconcile::{Exclusion, ReconcileOutcome, Reconciler, RequiredAttribute};
pub use rows::RowBuilder;
pub use stock::{
    format_inventory_description, format_inventory_title, DealerLocation, StockConfig, StockSegment,
};

pub const CRATE_NAME: &str = "offerfeed-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct FeedRegistry {
    pub feeds: Vec<FeedConfig>,
}

fn default_true() -> bool {
    true
}

fn default_powertrain() -> String {
    "Gasoline".to_string()
}

fn default_trim() -> String {
    "Standard".to_string()
}

fn default_disclaimer() -> String {
    "Oferta leasingowa. Szczegóły u dealera.".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateSettings {
    #[serde(default = "GateSettings::default_min_rows")]
    pub min_rows: usize,
    #[serde(default = "GateSettings::default_warn_drop_ratio")]
    pub warn_drop_ratio: f64,
    #[serde(default = "GateSettings::default_hard_drop_ratio")]
    pub hard_drop_ratio: Option<f64>,
    #[serde(default = "GateSettings::default_min_artifact_bytes")]
    pub min_artifact_bytes: u64,
}

impl GateSettings {
    fn default_min_rows() -> usize {
        GateConfig::default().min_rows
    }

    fn default_warn_drop_ratio() -> f64 {
        GateConfig::default().warn_drop_ratio
    }

    fn default_hard_drop_ratio() -> Option<f64> {
        GateConfig::default().hard_drop_ratio
    }

    fn default_min_artifact_bytes() -> u64 {
        GateConfig::default().min_artifact_bytes
    }
}

impl Default for GateSettings {
    fn default() -> Self {
        let defaults = GateConfig::default();
        Self {
            min_rows: defaults.min_rows,
            warn_drop_ratio: defaults.warn_drop_ratio,
            hard_drop_ratio: defaults.hard_drop_ratio,
            min_artifact_bytes: defaults.min_artifact_bytes,
        }
    }
}

/// Offer feeds publish one row per model variant; stock feeds one row per vehicle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    #[default]
    Offers,
    Stock,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub feed_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub kind: FeedKind,
    pub make: String,
    pub year: String,
    pub id_prefix: String,
    pub output: String,
    #[serde(default)]
    pub archive_dir: Option<String>,
    #[serde(default)]
    pub gate: GateSettings,
    #[serde(default = "default_powertrain")]
    pub default_powertrain: String,
    #[serde(default = "default_disclaimer")]
    pub default_disclaimer: String,
    #[serde(default)]
    pub default_image: Option<String>,
    /// Template names in the order they should be tried; all defaults when absent.
    #[serde(default)]
    pub templates: Option<Vec<String>>,
    /// Prior catalog CSV used as color and image fallback for every model.
    #[serde(default)]
    pub inventory: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    /// Listing and dealer settings of a stock feed.
    #[serde(default)]
    pub stock: Option<StockConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub link: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub legal: Option<String>,
    #[serde(default)]
    pub config_api: Option<String>,
    #[serde(default)]
    pub render_url_template: Option<String>,
    #[serde(default)]
    pub powertrain: Option<String>,
    #[serde(default)]
    pub trims: Vec<String>,
    #[serde(default = "default_trim")]
    pub default_trim: String,
}

impl FeedConfig {
    pub fn gate_config(&self, workspace_root: &Path) -> GateConfig {
        GateConfig {
            min_rows: self.gate.min_rows,
            warn_drop_ratio: self.gate.warn_drop_ratio,
            hard_drop_ratio: self.gate.hard_drop_ratio,
            min_artifact_bytes: self.gate.min_artifact_bytes,
            archive_dir: self.archive_dir.as_ref().map(|d| workspace_root.join(d)),
        }
    }

    pub fn trim_catalogs(&self) -> TrimCatalogs {
        let mut catalogs = TrimCatalogs::new(default_trim());
        for model in &self.models {
            catalogs.insert(
                &model.model,
                TrimCatalog::new(model.trims.iter().cloned(), model.default_trim.clone()),
            );
        }
        catalogs
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub feeds_path: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_attempts: usize,
    pub fetch_delay_ms: u64,
    pub concurrency: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("OFFERFEED_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            feeds_path: std::env::var("OFFERFEED_FEEDS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("feeds.yaml")),
            reports_dir: std::env::var("OFFERFEED_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("reports")),
            user_agent: std::env::var("OFFERFEED_USER_AGENT")
                .unwrap_or_else(|_| "offerfeed-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("OFFERFEED_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            fetch_attempts: std::env::var("OFFERFEED_FETCH_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            fetch_delay_ms: std::env::var("OFFERFEED_FETCH_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            concurrency: std::env::var("OFFERFEED_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            workspace_root,
        }
    }

    /// Defaults rooted at `workspace_root`, ignoring the environment.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            feeds_path: workspace_root.join("feeds.yaml"),
            reports_dir: workspace_root.join("reports"),
            user_agent: "offerfeed-bot/0.1".to_string(),
            http_timeout_secs: 20,
            fetch_attempts: 3,
            fetch_delay_ms: 3000,
            concurrency: 8,
            workspace_root,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.concurrency,
            retry: RetryPolicy {
                max_attempts: self.fetch_attempts,
                delay: Duration::from_millis(self.fetch_delay_ms),
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelExtraction {
    pub model: String,
    pub template: Option<String>,
    pub offers: usize,
    pub base_variants: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedRunReport {
    pub feed_id: String,
    pub kind: FeedKind,
    pub output: String,
    pub candidate_rows: usize,
    pub publish: Option<PublishResult>,
    pub extractions: Vec<ModelExtraction>,
    pub exclusions: Vec<Exclusion>,
    pub fetch_failures: Vec<String>,
    /// Stock vehicles left out, with the reason.
    pub skipped_items: Vec<String>,
    pub error: Option<String>,
}

impl FeedRunReport {
    fn empty(feed: &FeedConfig) -> Self {
        Self {
            feed_id: feed.feed_id.clone(),
            kind: feed.kind,
            output: feed.output.clone(),
            candidate_rows: 0,
            publish: None,
            extractions: Vec::new(),
            exclusions: Vec::new(),
            fetch_failures: Vec::new(),
            skipped_items: Vec::new(),
            error: None,
        }
    }

    pub fn published(&self) -> bool {
        self.publish.as_ref().map(|p| p.accepted).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds: Vec<FeedRunReport>,
    pub reports_dir: String,
}

impl SyncRunSummary {
    pub fn published_feeds(&self) -> usize {
        self.feeds.iter().filter(|f| f.published()).count()
    }
}

/// Raw inputs of one model, gathered concurrently.
#[derive(Debug, Clone)]
struct ModelInputs {
    model: ModelConfig,
    page: Option<String>,
    legal: Option<String>,
    config_api: Option<JsonValue>,
    failures: Vec<String>,
}

pub fn is_remote(reference: &str) -> bool {
    let lower = reference.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Fetches URLs through the resilient fetcher; anything else is a path under the workspace.
pub async fn load_input(
    fetcher: &HttpFetcher,
    workspace_root: &Path,
    source_id: &str,
    reference: &str,
) -> Result<String> {
    if is_remote(reference) {
        fetcher
            .fetch_text(source_id, reference)
            .await
            .with_context(|| format!("fetching {reference}"))
    } else {
        let path = workspace_root.join(reference);
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }
}

pub async fn load_feed_registry(path: &Path) -> Result<FeedRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub struct FeedPipeline {
    config: SyncConfig,
    fetcher: Arc<HttpFetcher>,
    gate: PublishGate,
    templates: TemplateRegistry,
}

impl FeedPipeline {
    pub fn new(config: SyncConfig, alerter: Arc<dyn Alerter>) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config(), alerter.clone())?;
        let templates = TemplateRegistry::with_defaults().context("compiling offer templates")?;
        Ok(Self {
            config,
            fetcher: Arc::new(fetcher),
            gate: PublishGate::new(GateConfig::default(), alerter),
            templates,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = load_feed_registry(&self.config.feeds_path).await?;
        let enabled: Vec<_> = registry.feeds.into_iter().filter(|f| f.enabled).collect();
        info!(%run_id, feeds = enabled.len(), "sync run started");

        let mut feeds = Vec::with_capacity(enabled.len());
        for feed in &enabled {
            let span = info_span!("feed", feed_id = %feed.feed_id);
            let report = match self.run_feed(feed).instrument(span).await {
                Ok(report) => report,
                Err(err) => {
                    error!(feed_id = %feed.feed_id, error = %format!("{err:#}"), "feed failed");
                    FeedRunReport {
                        error: Some(format!("{err:#}")),
                        ..FeedRunReport::empty(feed)
                    }
                }
            };
            feeds.push(report);
        }

        let finished_at = Utc::now();
        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            feeds,
            reports_dir: reports_dir.display().to_string(),
        };
        write_reports(&reports_dir, &summary).await?;
        info!(%run_id, published = summary.published_feeds(), "sync run finished");
        Ok(summary)
    }

    pub async fn run_feed(&self, feed: &FeedConfig) -> Result<FeedRunReport> {
        let report = FeedRunReport::empty(feed);
        match feed.kind {
            FeedKind::Offers => self.run_offer_feed(feed, report).await,
            FeedKind::Stock => self.run_stock_feed(feed, report).await,
        }
    }

    async fn run_offer_feed(&self, feed: &FeedConfig, mut report: FeedRunReport) -> Result<FeedRunReport> {
        let root = &self.config.workspace_root;
        let templates = match &feed.templates {
            Some(names) => self
                .templates
                .select(names)
                .with_context(|| format!("selecting templates for feed {}", feed.feed_id))?,
            None => self.templates.clone(),
        };
        let catalogs = feed.trim_catalogs();

        let inventory = match &feed.inventory {
            Some(reference) => {
                let source_id = format!("{}:inventory", feed.feed_id);
                match load_input(&self.fetcher, root, &source_id, reference).await {
                    Ok(text) => match InventorySource::from_csv(source_id, text.as_bytes()) {
                        Ok(source) => Some(Arc::new(source)),
                        Err(err) => {
                            warn!(error = %err, "inventory unreadable; continuing without it");
                            report.fetch_failures.push(format!("inventory: {err}"));
                            None
                        }
                    },
                    Err(err) => {
                        warn!(error = %format!("{err:#}"), "inventory unavailable; continuing without it");
                        report.fetch_failures.push(format!("inventory: {err:#}"));
                        None
                    }
                }
            }
            None => None,
        };

        let mut inputs = self.gather_inputs(feed).await;
        inputs.sort_by(|a, b| a.model.model.cmp(&b.model.model));

        let mut outcome = ReconcileOutcome::default();
        let mut rows = Vec::new();

        for input in inputs {
            let builder = RowBuilder {
                make: feed.make.clone(),
                year: feed.year.clone(),
                default_trim: input.model.default_trim.clone(),
                default_disclaimer: feed.default_disclaimer.clone(),
            };
            report.fetch_failures.extend(input.failures.iter().cloned());
            let (sources, bases, extraction) =
                self.model_sources(feed, &input, &templates, &catalogs, inventory.clone());
            let reconciled = Reconciler::new(sources).reconcile_all(&bases);
            info!(
                model = %input.model.model,
                variants = reconciled.variants.len(),
                excluded = reconciled.exclusions.len(),
                "model reconciled"
            );
            report.extractions.push(extraction);
            rows.extend(reconciled.variants.iter().map(|v| builder.build(v)));
            outcome.extend(reconciled);
        }

        let keys: Vec<_> = outcome.variants.iter().map(|v| v.key.clone()).collect();
        let ids = IdentityAssigner::new(&feed.id_prefix).assign(&keys);
        for (row, id) in rows.iter_mut().zip(ids) {
            row.vehicle_id = id;
        }
        report.candidate_rows = rows.len();
        report.exclusions = outcome.exclusions;

        let gate = self.gate.with_config(feed.gate_config(root));
        let result = gate.publish(rows, &root.join(&feed.output)).await;
        report.publish = Some(result);
        Ok(report)
    }

    async fn gather_inputs(&self, feed: &FeedConfig) -> Vec<ModelInputs> {
        let mut set = JoinSet::new();
        for model in &feed.models {
            let fetcher = Arc::clone(&self.fetcher);
            let root = self.config.workspace_root.clone();
            let source_id = format!("{}:{}", feed.feed_id, model.model);
            let model = model.clone();
            set.spawn(async move {
                let mut inputs = ModelInputs {
                    model: model.clone(),
                    page: None,
                    legal: None,
                    config_api: None,
                    failures: Vec::new(),
                };
                let refs = [
                    ("page", model.page.as_deref()),
                    ("legal", model.legal.as_deref()),
                    ("config_api", model.config_api.as_deref()),
                ];
                for (kind, reference) in refs {
                    let Some(reference) = reference else {
                        continue;
                    };
                    let text = match load_input(&fetcher, &root, &source_id, reference).await {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(model = %model.model, kind, error = %format!("{err:#}"), "input skipped");
                            inputs.failures.push(format!("{} {kind}: {err:#}", model.model));
                            continue;
                        }
                    };
                    match kind {
                        "page" => inputs.page = Some(text),
                        "legal" => inputs.legal = Some(text),
                        _ => match serde_json::from_str(&text) {
                            Ok(json) => inputs.config_api = Some(json),
                            Err(err) => {
                                warn!(model = %model.model, error = %err, "configurator payload is not json");
                                inputs.failures.push(format!("{} config_api: {err}", model.model));
                            }
                        },
                    }
                }
                inputs
            });
        }

        let mut gathered = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(inputs) => gathered.push(inputs),
                Err(err) => error!(error = %err, "input task failed"),
            }
        }
        gathered
    }

    /// Builds the ranked sources of one model and the base variants they describe.
    fn model_sources(
        &self,
        feed: &FeedConfig,
        input: &ModelInputs,
        templates: &TemplateRegistry,
        catalogs: &TrimCatalogs,
        inventory: Option<Arc<InventorySource>>,
    ) -> (Vec<Arc<dyn AttributeSource>>, Vec<BaseVariant>, ModelExtraction) {
        let model = &input.model;
        let source_prefix = format!("{}:{}", feed.feed_id, model.model);
        let powertrain = model
            .powertrain
            .clone()
            .unwrap_or_else(|| feed.default_powertrain.clone());
        let base_url = model
            .page
            .as_deref()
            .filter(|p| is_remote(p))
            .unwrap_or(&model.link);

        let page = match input.page.as_deref().map(|html| EmbeddedPage::parse(html, Some(base_url))) {
            Some(Ok(page)) => page,
            Some(Err(err)) => {
                warn!(model = %model.model, error = %err, "page unreadable");
                EmbeddedPage::default()
            }
            None => EmbeddedPage::default(),
        };

        let primary = match &input.legal {
            Some(legal) => legal.clone(),
            None => page.legal_text(),
        };
        let extraction = templates.extract_with_fallback(&primary, &page.body_text);
        if let Extraction::NoOffers = extraction {
            info!(model = %model.model, "no offers found in legal text or page body");
        }
        let template = extraction.template().map(ToString::to_string);
        let offers: Vec<_> = extraction
            .into_offers()
            .into_iter()
            .map(|offer| {
                let trim = (!offer.trim_hint.trim().is_empty())
                    .then(|| catalogs.resolve(&model.model, &offer.trim_hint).to_string());
                PageOffer::new(trim, offer)
            })
            .collect();
        let offer_count = offers.len();
        // One base variant per distinct (trim, powertrain) the page names.
        let offer_keys: BTreeSet<(String, String)> = offers
            .iter()
            .filter_map(|offer| {
                let trim = offer.trim.clone()?;
                let engine = offer.powertrain.clone().unwrap_or_else(|| powertrain.clone());
                Some((trim, engine))
            })
            .collect();
        let has_model_wide = offers.iter().any(|offer| offer.trim.is_none());

        let mut sources: Vec<Arc<dyn AttributeSource>> = vec![Arc::new(PageEmbeddedSource::new(
            format!("{source_prefix}:page"),
            Some(model.link.clone()),
            page.slides.clone(),
            offers,
        ))];

        let mut bases = Vec::new();
        if let Some(payload) = &input.config_api {
            match ConfigApiSource::from_json(
                format!("{source_prefix}:config_api"),
                &model.model,
                payload,
                model.render_url_template.as_deref(),
            ) {
                Ok(api) => {
                    bases = api.base_variants();
                    sources.push(Arc::new(api));
                }
                Err(err) => warn!(model = %model.model, error = %err, "configurator payload unusable"),
            }
        }
        if bases.is_empty() {
            let mut seen = BTreeSet::new();
            bases = offer_keys
                .iter()
                .filter(|(trim, engine)| {
                    seen.insert((normalize_identity_part(trim), normalize_identity_part(engine)))
                })
                .map(|(trim, engine)| BaseVariant::new(&model.model, trim, engine))
                .collect();
            if bases.is_empty() && has_model_wide {
                bases.push(BaseVariant::new(&model.model, &model.default_trim, &powertrain));
            }
        }

        if let Some(inventory) = inventory {
            sources.push(inventory);
        }

        let mut defaults = AttributeMap::new();
        defaults.insert(AttributeKey::Link, model.link.clone());
        defaults.insert(AttributeKey::Disclaimer, feed.default_disclaimer.clone());
        if let Some(image) = model.image.clone().or_else(|| feed.default_image.clone()) {
            defaults.insert(AttributeKey::Image, image);
        }
        sources.push(Arc::new(StaticSource::new(
            format!("{source_prefix}:defaults"),
            defaults,
        )));

        let extraction = ModelExtraction {
            model: model.model.clone(),
            template,
            offers: offer_count,
            base_variants: bases.len(),
        };
        (sources, bases, extraction)
    }
}

pub async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(reports_dir.join("daily_brief.md"), daily_brief_markdown(summary))
        .await
        .context("writing daily_brief.md")?;
    Ok(())
}

pub fn daily_brief_markdown(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# Offer Feed Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Feeds published: {}/{}",
            summary.published_feeds(),
            summary.feeds.len()
        ),
        String::new(),
    ];

    for feed in &summary.feeds {
        lines.push(format!("## {}", feed.feed_id));
        if let Some(err) = &feed.error {
            lines.push(format!("- failed: {err}"));
        }
        if let Some(publish) = &feed.publish {
            let status = match &publish.rejection_reason {
                None => "published".to_string(),
                Some(reason) => format!("rejected ({reason})"),
            };
            lines.push(format!("- status: {status}"));
            lines.push(format!("- rows: {}", publish.row_count));
            if let Some(previous) = publish.previous_count {
                lines.push(format!("- previous rows: {previous}"));
            }
            if let Some(ratio) = publish.drop_ratio {
                lines.push(format!("- drop: {:.1}%", ratio * 100.0));
            }
            for warning in &publish.warnings {
                lines.push(format!("- warning: {warning}"));
            }
        }
        lines.push(format!("- excluded variants: {}", feed.exclusions.len()));
        for extraction in &feed.extractions {
            lines.push(format!(
                "- {}: {} offers via {}",
                extraction.model,
                extraction.offers,
                extraction.template.as_deref().unwrap_or("none")
            ));
        }
        for failure in &feed.fetch_failures {
            lines.push(format!("- input failure: {failure}"));
        }
        for skipped in &feed.skipped_items {
            lines.push(format!("- skipped: {skipped}"));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

/// Markdown digest of the most recent `runs` run summaries under `reports_dir`.
pub fn report_recent_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Offer Feed Recent Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join("run_summary.json");
        let value: JsonValue = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## Run `{}`", dir.file_name().to_string_lossy()));
        let feeds = value
            .get("feeds")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let mut by_status: BTreeMap<&str, usize> = BTreeMap::new();
        for feed in feeds {
            let status = match feed.get("publish").and_then(|p| p.get("accepted")) {
                Some(JsonValue::Bool(true)) => "published",
                Some(_) => "rejected",
                None => "failed",
            };
            *by_status.entry(status).or_default() += 1;
        }
        for (status, count) in by_status {
            lines.push(format!("- {status}: {count}"));
        }
        lines.push(format!("- summary: `{}`", summary_path.display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let alerter = build_alerter(&AlertConfig::from_env());
    FeedPipeline::new(config, alerter)?.run_once().await
}
