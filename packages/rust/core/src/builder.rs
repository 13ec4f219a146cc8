//! Knowledge-base build orchestration.
//!
//! A build runs five stages in order: select records, enrich them, fetch
//! attachments, ensure the dataset exists, and publish documents in batches.
//! Only selection and dataset failures abort a run; everything after that is
//! accounted for per record in the [`BuildResult`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use refkb_fetch::EnrichmentClient;
use refkb_gateway::{DocumentMetadata, KnowledgeBaseGateway, MetadataField, ProcessMode, Segmentation};
use refkb_shared::{
    BuildConfig, BuildRequest, BuildResult, EnrichedRecord, PublishOutcome, RefKbError,
    ReferenceRecord, Result,
};
use refkb_storage::{DocumentLedger, ReferenceStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::document::{metadata_values, write_document};
use crate::enrichment::{enrich_records, fetch_attachments};

/// Failure reason recorded for records skipped after cancellation.
pub const CANCELLED_REASON: &str = "cancelled";

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting build status.
pub trait BuildProgress: Send + Sync {
    /// Called when entering a new stage.
    fn phase(&self, name: &str);
    /// Called as each record leaves the enrich or attachment stage.
    fn record_enriched(&self, record_id: &str, current: usize, total: usize);
    /// Called after each publish attempt.
    fn record_published(&self, record_id: &str, outcome: &PublishOutcome, current: usize, total: usize);
    /// Called once with the final result.
    fn done(&self, result: &BuildResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl BuildProgress for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn record_enriched(&self, _record_id: &str, _current: usize, _total: usize) {}
    fn record_published(&self, _record_id: &str, _outcome: &PublishOutcome, _current: usize, _total: usize) {}
    fn done(&self, _result: &BuildResult) {}
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Runs builds against one reference store and one knowledge-base service.
pub struct KnowledgeBuilder {
    store: Arc<ReferenceStore>,
    gateway: KnowledgeBaseGateway,
    enrichment: EnrichmentClient,
    ledger: Arc<DocumentLedger>,
    config: BuildConfig,
    progress: Arc<dyn BuildProgress>,
}

impl KnowledgeBuilder {
    pub fn new(
        store: Arc<ReferenceStore>,
        gateway: KnowledgeBaseGateway,
        enrichment: EnrichmentClient,
        ledger: Arc<DocumentLedger>,
        config: BuildConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            enrichment,
            ledger,
            config,
            progress: Arc::new(SilentProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn BuildProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn gateway(&self) -> &KnowledgeBaseGateway {
        &self.gateway
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Run one build. Never returns an error: failures are reported in the
    /// result's `success` flag and message.
    #[instrument(skip_all, fields(dataset = %request.dataset_name))]
    pub async fn build(&self, request: &BuildRequest, token: &CancellationToken) -> BuildResult {
        let start = Instant::now();
        let result = self.run(request, token).await;
        info!(
            success = result.success,
            total = result.total_items,
            processed = result.processed_items,
            failed = result.failed_items,
            cancelled = result.cancelled,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "build finished"
        );
        self.progress.done(&result);
        result
    }

    async fn run(&self, request: &BuildRequest, token: &CancellationToken) -> BuildResult {
        let progress = self.progress.as_ref();

        // --- Stage 1: Select ---
        progress.phase("Selecting records");
        let records = match self.select(request).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "record selection failed");
                return BuildResult::aborted(format!("failed to select records: {e}"));
            }
        };
        if records.is_empty() {
            return BuildResult::aborted("no records matched the selection");
        }
        info!(count = records.len(), "records selected");

        let mode: ProcessMode = match self.config.process_mode.parse() {
            Ok(mode) => mode,
            Err(e) => return BuildResult::aborted(e.to_string()),
        };

        // --- Stage 2: Enrich ---
        progress.phase("Enriching records");
        let mut items = enrich_records(
            records,
            &self.enrichment,
            self.config.api_base_url.as_deref(),
            self.config.summary_max_chars,
            self.config.concurrency,
            token,
            progress,
        )
        .await;

        // --- Stage 3: Attachments ---
        let run_dir = self.config.scratch_dir.join(Uuid::now_v7().to_string());
        if request.include_attachments {
            progress.phase("Downloading attachments");
            items = fetch_attachments(
                items,
                &self.enrichment,
                &run_dir,
                self.config.concurrency,
                token,
                progress,
            )
            .await;
        }

        let result = self.publish_all(request, items, mode, &run_dir, token).await;

        if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %run_dir.display(), error = %e, "failed to remove scratch directory");
            }
        }
        result
    }

    async fn select(&self, request: &BuildRequest) -> Result<Vec<ReferenceRecord>> {
        if let Some(id) = request.report_id.as_deref().filter(|id| !id.trim().is_empty()) {
            return self.store.query_by_id(id).await;
        }
        match &request.query_conditions {
            Some(conditions) if !conditions.is_empty() => {
                self.store.query_by_conditions(conditions).await
            }
            _ => self.store.query_recent(self.config.recent_limit).await,
        }
    }

    /// Stages 4 and 5: ensure the dataset, then publish in batches.
    async fn publish_all(
        &self,
        request: &BuildRequest,
        items: Vec<EnrichedRecord>,
        mode: ProcessMode,
        run_dir: &Path,
        token: &CancellationToken,
    ) -> BuildResult {
        if token.is_cancelled() {
            let outcomes = items
                .iter()
                .map(|item| (item.record.id.clone(), cancelled()))
                .collect();
            return BuildResult::from_outcomes(None, outcomes, true);
        }

        // --- Stage 4: Dataset ---
        self.progress.phase("Preparing dataset");
        let dataset_id = match self.ensure_dataset(request).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "dataset preparation failed");
                return BuildResult::aborted(format!("failed to prepare dataset: {e}"));
            }
        };
        let fields = self.ensure_metadata_fields(&dataset_id).await;

        // --- Stage 5: Publish ---
        self.progress.phase("Publishing documents");
        let segmentation = Segmentation {
            separator: self.config.separator.clone(),
            max_tokens: self.config.max_tokens,
        };
        let reuse_ledger = request.existing_dataset_id.is_some();
        let total = items.len();
        let batch_size = request.batch_size.max(1);
        let mut outcomes = BTreeMap::new();
        let mut cancelled_run = false;
        let mut done = 0usize;

        for (batch_index, batch) in items.chunks(batch_size).enumerate() {
            if batch_index > 0 && !self.config.batch_pause.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(self.config.batch_pause) => {}
                }
            }

            let mut batch_metadata = Vec::new();
            for item in batch {
                done += 1;
                let outcome = if token.is_cancelled() {
                    cancelled_run = true;
                    cancelled()
                } else {
                    match self
                        .publish_one(&dataset_id, item, mode, &segmentation, reuse_ledger, run_dir)
                        .await
                    {
                        Ok(document_id) => {
                            let values = metadata_values(&item.record, &fields);
                            if !values.is_empty() {
                                batch_metadata.push(DocumentMetadata {
                                    document_id: document_id.clone(),
                                    metadata_list: values,
                                });
                            }
                            PublishOutcome::Published { document_id }
                        }
                        Err(e) => {
                            warn!(record_id = %item.record.id, error = %e, "publish failed");
                            PublishOutcome::Failed {
                                reason: e.to_string(),
                            }
                        }
                    }
                };
                self.progress
                    .record_published(&item.record.id, &outcome, done, total);
                outcomes.insert(item.record.id.clone(), outcome);
            }

            if let Err(e) = self
                .gateway
                .add_document_metadata(&dataset_id, &batch_metadata)
                .await
            {
                warn!(batch = batch_index, error = %e, "failed to attach document metadata");
            }
        }

        BuildResult::from_outcomes(Some(dataset_id), outcomes, cancelled_run)
    }

    async fn ensure_dataset(&self, request: &BuildRequest) -> Result<String> {
        if let Some(id) = request.existing_dataset_id.as_deref() {
            let dataset = self.gateway.get_dataset(id).await?;
            if let Some(description) = request.description.as_deref() {
                if dataset.description.as_deref() != Some(description) {
                    if let Err(e) = self.gateway.update_dataset(id, None, Some(description)).await {
                        warn!(dataset_id = %id, error = %e, "failed to update dataset description");
                    }
                }
            }
            info!(dataset_id = %id, "reusing existing dataset");
            return Ok(dataset.id);
        }

        let id = self
            .gateway
            .create_dataset(
                &request.dataset_name,
                request.description.as_deref(),
                &self.config.permission,
                &self.config.indexing_technique,
            )
            .await?;
        info!(dataset_id = %id, "dataset created");
        Ok(id)
    }

    /// Make sure every configured metadata field exists; returns the fields
    /// usable for document metadata. Failures only shrink the list.
    async fn ensure_metadata_fields(&self, dataset_id: &str) -> Vec<MetadataField> {
        if self.config.metadata_fields.is_empty() {
            return Vec::new();
        }

        let mut known: HashMap<String, MetadataField> =
            match self.gateway.list_dataset_metadata(dataset_id).await {
                Ok(fields) => fields.into_iter().map(|f| (f.name.clone(), f)).collect(),
                Err(e) => {
                    warn!(%dataset_id, error = %e, "failed to list metadata fields");
                    HashMap::new()
                }
            };

        let missing: Vec<String> = self
            .config
            .metadata_fields
            .iter()
            .filter(|name| !known.contains_key(*name))
            .cloned()
            .collect();
        for outcome in self.gateway.add_dataset_metadata(dataset_id, &missing).await {
            if let Ok(field) = outcome.result {
                known.insert(outcome.name, field);
            }
        }

        self.config
            .metadata_fields
            .iter()
            .filter_map(|name| known.get(name).cloned())
            .collect()
    }

    /// Upload one record and record its document id in the ledger.
    async fn publish_one(
        &self,
        dataset_id: &str,
        item: &EnrichedRecord,
        mode: ProcessMode,
        segmentation: &Segmentation,
        reuse_ledger: bool,
        run_dir: &Path,
    ) -> Result<String> {
        let path: PathBuf = match &item.local_attachment_path {
            Some(path) => path.clone(),
            None => write_document(&run_dir.join("documents"), item).await?,
        };
        let identity = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RefKbError::validation(format!("no file name in {}", path.display())))?;
        let mode = mode.to_string();

        let previous = if reuse_ledger {
            match self.ledger.get(&identity).await {
                Ok(previous) => previous,
                Err(e) => {
                    warn!(%identity, error = %e, "ledger lookup failed");
                    None
                }
            }
        } else {
            None
        };

        let document_id = match previous {
            Some(document_id) => {
                debug!(%identity, %document_id, "updating existing document");
                self.gateway
                    .update_document_by_file(
                        dataset_id,
                        &document_id,
                        &path,
                        Some(&identity),
                        &self.config.indexing_technique,
                        &mode,
                        segmentation,
                    )
                    .await?
            }
            None => {
                self.gateway
                    .create_document_by_file(
                        dataset_id,
                        &path,
                        &self.config.indexing_technique,
                        &mode,
                        segmentation,
                    )
                    .await?
            }
        };

        if let Err(e) = self.ledger.set(&identity, &document_id).await {
            warn!(%identity, %document_id, error = %e, "failed to record document id");
        }
        Ok(document_id)
    }
}

fn cancelled() -> PublishOutcome {
    PublishOutcome::Failed {
        reason: CANCELLED_REASON.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
