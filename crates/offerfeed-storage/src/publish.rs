use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use offerfeed_core::{FeedRow, PublishResult, PublishState, RejectionReason};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::alert::{Alert, Alerter};
use crate::catalog::{count_catalog_rows, encode_catalog_csv, validate_rows};

#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub min_rows: usize,
    /// Drops above this publish with a warning alert.
    pub warn_drop_ratio: f64,
    /// Drops above this are rejected. `None` never rejects on drop.
    pub hard_drop_ratio: Option<f64>,
    pub min_artifact_bytes: u64,
    /// Defaults to `archive/` next to the live file.
    pub archive_dir: Option<PathBuf>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_rows: 5,
            warn_drop_ratio: 0.5,
            hard_drop_ratio: Some(0.6),
            min_artifact_bytes: 10,
            archive_dir: None,
        }
    }
}

type TargetLocks = Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>;

/// Validates a candidate catalog and atomically swaps it in for the live one.
pub struct PublishGate {
    config: GateConfig,
    alerter: Arc<dyn Alerter>,
    targets: TargetLocks,
}

impl PublishGate {
    pub fn new(config: GateConfig, alerter: Arc<dyn Alerter>) -> Self {
        Self {
            config,
            alerter,
            targets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Same alerter and target locks, different thresholds.
    pub fn with_config(&self, config: GateConfig) -> Self {
        Self {
            config,
            alerter: self.alerter.clone(),
            targets: self.targets.clone(),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Fractional shrink relative to the previous count; `None` when there is nothing to compare.
    pub fn drop_ratio(previous: Option<usize>, count: usize) -> Option<f64> {
        match previous {
            Some(prev) if prev > 0 && count < prev => Some((prev - count) as f64 / prev as f64),
            Some(prev) if prev > 0 => Some(0.0),
            _ => None,
        }
    }

    async fn target_lock(&self, live_path: &Path) -> Arc<Mutex<()>> {
        let mut map = self.targets.lock().await;
        map.entry(live_path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn publish<R: FeedRow>(&self, rows: Vec<R>, live_path: &Path) -> PublishResult {
        let lock = self.target_lock(live_path).await;
        let _guard = lock.lock().await;
        let span = info_span!("publish", target = %live_path.display(), rows = rows.len());
        self.publish_locked(rows, live_path).instrument(span).await
    }

    async fn publish_locked<R: FeedRow>(&self, mut rows: Vec<R>, live_path: &Path) -> PublishResult {
        debug!(state = ?PublishState::CandidateReady);
        let count = rows.len();
        let mut result = PublishResult {
            accepted: false,
            row_count: count,
            previous_count: None,
            drop_ratio: None,
            rejection_reason: None,
            warnings: Vec::new(),
            live_path: live_path.display().to_string(),
            archive_path: None,
            decided_at: Utc::now(),
        };

        debug!(state = ?PublishState::Validating);
        if count < self.config.min_rows {
            let reason = RejectionReason::TooFewRows {
                count,
                min_rows: self.config.min_rows,
            };
            return self.reject(result, reason, "Data Threshold Error").await;
        }

        // An unreadable live file has no usable count; it is still archived on swap.
        let previous = match count_catalog_rows(live_path).await {
            Ok(previous) => previous,
            Err(err) => {
                let message = format!(
                    "previous catalog {} is unreadable, skipping drop check: {err:#}",
                    live_path.display()
                );
                warn!("{message}");
                self.alerter
                    .send(&Alert::warning("Unreadable Previous Catalog", message.clone()))
                    .await;
                result.warnings.push(message);
                None
            }
        };
        result.previous_count = previous;
        result.drop_ratio = Self::drop_ratio(previous, count);

        if let (Some(prev), Some(ratio)) = (previous, result.drop_ratio) {
            if let Some(limit) = self.config.hard_drop_ratio {
                if ratio > limit {
                    let reason = RejectionReason::ExcessiveDrop {
                        previous: prev,
                        count,
                        drop_ratio: ratio,
                        limit,
                    };
                    return self.reject(result, reason, "Data Drop Error").await;
                }
            }
            if ratio > self.config.warn_drop_ratio {
                let message = format!(
                    "row count dropped {:.0}% ({prev} -> {count}) for {}",
                    ratio * 100.0,
                    live_path.display()
                );
                warn!("{message}");
                self.alerter
                    .send(&Alert::warning("Data Drop Warning", message.clone()))
                    .await;
                result.warnings.push(message);
            }
        }

        let problems = validate_rows(&rows);
        if !problems.is_empty() {
            let reason = RejectionReason::InvalidRows { problems };
            return self.reject(result, reason, "Data Integrity Error").await;
        }

        rows.sort_by(|a, b| a.vehicle_id().cmp(b.vehicle_id()));
        match self.replace_live(&rows, live_path).await {
            Ok(archive_path) => {
                result.accepted = true;
                result.archive_path = archive_path.map(|p| p.display().to_string());
                result.decided_at = Utc::now();
                info!(state = ?PublishState::Published, rows = count, previous = ?previous, "catalog published");
                result
            }
            Err(err) => {
                let reason = RejectionReason::Io {
                    message: format!("{err:#}"),
                };
                self.reject(result, reason, "Publish Error").await
            }
        }
    }

    async fn reject(
        &self,
        mut result: PublishResult,
        reason: RejectionReason,
        topic: &str,
    ) -> PublishResult {
        warn!(state = ?PublishState::Rejected, %reason, "catalog rejected");
        self.alerter
            .send(&Alert::error(
                topic,
                format!("{}: {reason}", result.live_path),
            ))
            .await;
        result.accepted = false;
        result.rejection_reason = Some(reason);
        result.decided_at = Utc::now();
        result
    }

    /// Writes a temp file beside the target, archives the current live file, then renames.
    async fn replace_live<R: FeedRow>(&self, rows: &[R], live_path: &Path) -> anyhow::Result<Option<PathBuf>> {
        let bytes = encode_catalog_csv(rows)?;
        let parent = match live_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = live_path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("live path {} has no file name", live_path.display()))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating catalog directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
        match self.write_and_swap(&bytes, &temp_path, live_path, file_name, &parent).await {
            Ok(archive) => Ok(archive),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
            }
        }
    }

    async fn write_and_swap(
        &self,
        bytes: &[u8],
        temp_path: &Path,
        live_path: &Path,
        file_name: &str,
        parent: &Path,
    ) -> anyhow::Result<Option<PathBuf>> {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(temp_path)
            .await
            .with_context(|| format!("opening temp catalog {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp catalog {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp catalog {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp catalog {}", temp_path.display()))?;
        drop(file);

        let written = fs::metadata(temp_path)
            .await
            .with_context(|| format!("inspecting temp catalog {}", temp_path.display()))?
            .len();
        if written < self.config.min_artifact_bytes {
            bail!(
                "temp catalog {} is {written} bytes, below {}",
                temp_path.display(),
                self.config.min_artifact_bytes
            );
        }

        let archive = self.archive_live(live_path, file_name, parent).await?;

        fs::rename(temp_path, live_path).await.with_context(|| {
            format!(
                "atomically renaming temp catalog {} -> {}",
                temp_path.display(),
                live_path.display()
            )
        })?;
        Ok(archive)
    }

    async fn archive_live(
        &self,
        live_path: &Path,
        file_name: &str,
        parent: &Path,
    ) -> anyhow::Result<Option<PathBuf>> {
        if !fs::try_exists(live_path)
            .await
            .with_context(|| format!("checking live catalog {}", live_path.display()))?
        {
            return Ok(None);
        }

        let archive_dir = self
            .config
            .archive_dir
            .clone()
            .unwrap_or_else(|| parent.join("archive"));
        fs::create_dir_all(&archive_dir)
            .await
            .with_context(|| format!("creating archive directory {}", archive_dir.display()))?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut archive_path = archive_dir.join(format!("{file_name}_{stamp}.bak"));
        let mut suffix = 1;
        while fs::try_exists(&archive_path).await? {
            suffix += 1;
            archive_path = archive_dir.join(format!("{file_name}_{stamp}_{suffix}.bak"));
        }

        fs::copy(live_path, &archive_path).await.with_context(|| {
            format!(
                "archiving {} -> {}",
                live_path.display(),
                archive_path.display()
            )
        })?;
        info!(archive = %archive_path.display(), "previous catalog archived");
        Ok(Some(archive_path))
    }
}
