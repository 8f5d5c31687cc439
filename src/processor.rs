use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::db::Store;
use crate::error::Result;
use crate::scorer::Scorer;
use crate::types::{DerivedRecord, RawPayload};

/// Outcome of one `process_batch` pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
    pub succeeded: usize,
    /// Event ids of payloads that failed scoring or persistence. Those
    /// payloads stay unprocessed for a later pass.
    pub failed: Vec<String>,
    /// Scored, but a newer body arrived meanwhile; that one is still queued.
    pub superseded: usize,
}

/// Drains unprocessed raw payloads through the scorer into derived records.
/// Reads only the store, never the network.
pub struct DerivedProcessor {
    store: Store,
    scorer: Arc<dyn Scorer>,
    cfg: ProcessorConfig,
}

impl DerivedProcessor {
    pub fn new(store: Store, scorer: Arc<dyn Scorer>, cfg: ProcessorConfig) -> Self {
        Self { store, scorer, cfg }
    }

    pub async fn run(self) {
        if self.cfg.reprocess {
            match self.store.requeue_all().await {
                Ok(n) => info!("[PROCESSOR] requeued {n} payloads for reprocessing"),
                Err(e) => error!("[PROCESSOR] requeue failed: {e}"),
            }
        }

        let mut interval = tokio::time::interval(self.cfg.interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.run_once().await {
                error!("[PROCESSOR] pass failed: {e}");
            }
        }
    }

    /// One processing pass followed by retention pruning.
    pub async fn run_once(&self) -> Result<BatchReport> {
        let report = self.process_batch(self.cfg.batch_size).await?;
        if report.succeeded > 0 || !report.failed.is_empty() {
            info!(
                succeeded = report.succeeded,
                failed = report.failed.len(),
                superseded = report.superseded,
                "[PROCESSOR] batch complete",
            );
        }

        let Some(cutoff) = Utc::now().checked_sub_signed(self.cfg.retention) else {
            warn!("[PROCESSOR] retention window out of range, skipping prune");
            return Ok(report);
        };
        let pruned = self.store.prune(cutoff).await?;
        if pruned > 0 {
            info!("[PROCESSOR] pruned {pruned} payloads past retention");
        }
        Ok(report)
    }

    /// Score up to `limit` unprocessed payloads. A failure on one payload
    /// never stops the rest of the batch; only failing to read the batch
    /// itself is an error.
    pub async fn process_batch(&self, limit: i64) -> Result<BatchReport> {
        let batch = self.store.list_unprocessed(limit).await?;
        let mut report = BatchReport::default();

        for payload in &batch {
            match self.process_one(payload).await {
                Ok(true) => report.succeeded += 1,
                Ok(false) => {
                    report.succeeded += 1;
                    report.superseded += 1;
                }
                Err(message) => {
                    warn!(
                        event_id = %payload.event_id,
                        kind = %payload.kind,
                        payload_id = payload.payload_ref.id,
                        class = "processing",
                        "[PROCESSOR] {message}",
                    );
                    if let Err(e) = self.store.record_failure(payload.payload_ref, &message).await {
                        error!(payload_id = payload.payload_ref.id, "[PROCESSOR] could not record failure: {e}");
                    }
                    report.failed.push(payload.event_id.clone());
                }
            }
        }
        Ok(report)
    }

    /// Ok(false) when the source moved to a newer revision while scoring.
    async fn process_one(&self, payload: &RawPayload) -> std::result::Result<bool, String> {
        let fields = self
            .scorer
            .score(payload)
            .map_err(|e| format!("scoring failed: {e}"))?;

        let record = DerivedRecord {
            source: payload.payload_ref,
            event_id: payload.event_id.clone(),
            kind: payload.kind,
            model_version: self.scorer.model_version().to_string(),
            computed_at: Utc::now(),
            fields,
        };
        self.store
            .upsert_derived(&record)
            .await
            .map_err(|e| format!("derived write failed: {e}"))?;

        let marked = self
            .store
            .mark_processed(payload.payload_ref)
            .await
            .map_err(|e| format!("mark processed failed: {e}"))?;
        if !marked {
            debug!(event_id = %payload.event_id, kind = %payload.kind, "source superseded during scoring");
        }
        Ok(marked)
    }
}
