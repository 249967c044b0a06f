//! Phase 3: external large-model endpoint with a persistent daily budget.
//!
//! The budget is enforced before the call, not after: a request whose
//! estimated cost does not fit in the remaining budget defers the item. The
//! budget file lives in the shared store so restarts and other instances
//! see the same remaining allowance.

use std::{fs, time::Duration};

use chrono::{NaiveDate, Utc};
use leaky_bucket::RateLimiter;
use serde::{Deserialize, Serialize};

use lib_field_extract::EmailMeta;

use crate::classify::DocumentKind;
use crate::config::{ExternalConfig, RetryConfig};
use crate::error::PipelineResult;
use crate::mail;
use crate::prompt::{InferenceBackend, ModelError, ModelReply};
use crate::store::claim::{claim, ClaimOutcome};
use crate::store::scan::InputItem;
use crate::store::{Artifact, FailReason, FailureRecord, WorkStore};

use super::{FsErrorStreak, PhaseStats, WorkerCtx};

use crate::phases::phase1::{content_md5, hex_sha256};

/// Conservative per-item cost estimate used for the pre-call budget check.
const ESTIMATED_TOKENS_PER_ITEM: u64 = 4_000;

/// Daily token budget persisted at `markers/phase3_budget.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenBudget {
    pub day: NaiveDate,
    pub tokens_used: u64,
    #[serde(skip)]
    limit: u64,
}

impl TokenBudget {
    pub fn load(store: &WorkStore, limit: u64) -> Self {
        let today = Utc::now().date_naive();
        let loaded = fs::read(store.budget_path())
            .ok()
            .and_then(|data| serde_json::from_slice::<TokenBudget>(&data).ok());
        match loaded {
            Some(mut budget) if budget.day == today => {
                budget.limit = limit;
                budget
            }
            _ => TokenBudget {
                day: today,
                tokens_used: 0,
                limit,
            },
        }
    }

    pub fn save(&self, store: &WorkStore) -> std::io::Result<()> {
        fs::write(
            store.budget_path(),
            serde_json::to_vec_pretty(self).unwrap_or_default(),
        )
    }

    /// Whether another call of the estimated size still fits today.
    pub fn allows(&mut self, estimated_tokens: u64) -> bool {
        self.roll_over();
        self.tokens_used + estimated_tokens <= self.limit
    }

    pub fn charge(&mut self, tokens: u64) {
        self.roll_over();
        self.tokens_used += tokens;
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.tokens_used)
    }

    fn roll_over(&mut self) {
        let today = Utc::now().date_naive();
        if self.day != today {
            self.day = today;
            self.tokens_used = 0;
        }
    }
}

pub struct Phase3Worker<B> {
    backend: B,
    model: String,
    timeout: Duration,
    retry: RetryConfig,
    limiter: RateLimiter,
    budget_limit: u64,
}

impl<B: InferenceBackend> Phase3Worker<B> {
    pub fn new(backend: B, cfg: &ExternalConfig) -> Self {
        let per_minute = cfg.requests_per_minute.max(1);
        Phase3Worker {
            backend,
            model: cfg.model.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            retry: cfg.retry.clone(),
            limiter: RateLimiter::builder()
                .initial(1)
                .interval(Duration::from_secs(60) / per_minute as u32)
                .max(per_minute)
                .refill(1)
                .build(),
            budget_limit: cfg.daily_token_budget,
        }
    }

    pub async fn run(
        &self,
        ctx: &mut WorkerCtx,
        records: &[FailureRecord],
        items_by_id: &dyn Fn(&str) -> Option<InputItem>,
    ) -> PipelineResult<PhaseStats> {
        let mut stats = PhaseStats::new(3, ctx.instance);
        let mut fs_errors = FsErrorStreak::default();
        let mut budget = TokenBudget::load(&ctx.store, self.budget_limit);

        tracing::info!(
            "phase 3 instance {} starting: {} records, {} tokens remaining today",
            ctx.instance,
            records.len(),
            budget.remaining()
        );

        for record in records {
            if !ctx.checkpoint().await {
                break;
            }

            if !budget.allows(ESTIMATED_TOKENS_PER_ITEM) {
                // Budget exhausted for the day; everything left is deferred,
                // not failed.
                tracing::warn!("daily token budget exhausted, deferring remaining items");
                for remaining in records.iter().skip_while(|r| r.item_id != record.item_id) {
                    if ctx.store.has_artifact(&remaining.item_id) {
                        continue;
                    }
                    ctx.store.append_deferred(&FailureRecord::new(
                        &remaining.item_id,
                        3,
                        FailReason::QuotaExhausted,
                        &remaining.snippet,
                    ))?;
                    stats.deferred += 1;
                }
                break;
            }

            let guard = match claim(&ctx.store, 3, &record.item_id, &ctx.host, ctx.stale_lock_ttl)
            {
                Ok(ClaimOutcome::Claimed(guard)) => guard,
                Ok(_) => {
                    stats.skipped += 1;
                    continue;
                }
                Err(e) => {
                    fs_errors.record(&record.item_id, &e.into())?;
                    continue;
                }
            };

            stats.processed += 1;
            match self
                .process_record(ctx, record, items_by_id, &mut budget)
                .await
            {
                Ok(Some(kind)) => {
                    stats.succeeded += 1;
                    stats.count_kind(kind);
                    fs_errors.clear();
                }
                Ok(None) => {
                    stats.failed += 1;
                    fs_errors.clear();
                }
                Err(e) => {
                    fs_errors.record(&record.item_id, &e)?;
                }
            }
            if let Err(e) = budget.save(&ctx.store) {
                tracing::warn!("could not persist budget: {e}");
            }

            if let Err(e) = guard.release() {
                tracing::warn!("failed to release lock for {}: {e}", record.item_id);
            }
        }

        if let Err(e) = stats.save(ctx) {
            tracing::warn!("could not persist stats: {e}");
        }
        stats.log_summary();
        Ok(stats)
    }

    async fn process_record(
        &self,
        ctx: &WorkerCtx,
        record: &FailureRecord,
        items_by_id: &dyn Fn(&str) -> Option<InputItem>,
        budget: &mut TokenBudget,
    ) -> PipelineResult<Option<DocumentKind>> {
        let item = items_by_id(&record.item_id);
        let (meta, text) = match &item {
            Some(item) => match item.eml_path().map(fs::read) {
                Some(Ok(raw)) => match mail::parse_eml(&raw) {
                    Ok(parsed) => (parsed.envelope.meta(), parsed.envelope.body.clone()),
                    Err(_) => (EmailMeta::default(), record.snippet.clone()),
                },
                _ => (EmailMeta::default(), record.snippet.clone()),
            },
            None => (EmailMeta::default(), record.snippet.clone()),
        };

        match self.call_with_retry(&meta, &text).await {
            Ok(reply) => {
                budget.charge(reply.total_tokens.max(1));

                let mut fields = reply.verdict.fields.clone();
                fields.set_str("email_from", meta.from.clone());
                fields.set_str("email_to", meta.to.clone());
                fields.set_str("email_subject", meta.subject.clone());

                let content_hash = match &item {
                    Some(item) => content_md5(item)?,
                    None => String::new(),
                };

                let artifact = Artifact {
                    item_id: record.item_id.clone(),
                    phase: 3,
                    doc_kind: reply.verdict.doc_kind,
                    fields,
                    raw_text_sha256: hex_sha256(&text),
                    content_md5: content_hash,
                    confidence: reply.verdict.confidence,
                    escalation_trace: None,
                    timestamp: Utc::now(),
                };

                if reply.verdict.doc_kind.is_accounting() {
                    let data =
                        lib_isdoc::InvoiceData::from_fields(&record.item_id, &artifact.fields);
                    ctx.store
                        .write_xml(&record.item_id, &lib_isdoc::render(&data))?;
                }

                ctx.store.write_artifact(&artifact)?;
                Ok(Some(reply.verdict.doc_kind))
            }
            Err(e) => {
                let reason = match e {
                    ModelError::Timeout => FailReason::ModelTimeout,
                    ModelError::RateLimited => FailReason::RateLimited,
                    _ => FailReason::ModelUnparseable,
                };
                ctx.store
                    .append_failure(&FailureRecord::new(&record.item_id, 3, reason, &text))?;
                Ok(None)
            }
        }
    }

    /// Bounded retry with exponential backoff; rate-limit responses wait a
    /// full backoff step before counting as an attempt.
    async fn call_with_retry(&self, meta: &EmailMeta, text: &str) -> Result<ModelReply, ModelError> {
        let mut last_error = ModelError::Timeout;
        for attempt in 0..self.retry.attempts {
            self.limiter.acquire_one().await;
            match self.backend.classify(&self.model, self.timeout, meta, text).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    tracing::warn!("external model attempt {} failed: {e}", attempt + 1);
                    last_error = e;
                }
            }
            if attempt + 1 < self.retry.attempts {
                let backoff = Duration::from_secs(self.retry.backoff_secs(attempt));
                tokio::time::sleep(backoff).await;
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn budget_persists_across_loads() {
        let dir = tempdir().unwrap();
        let store = WorkStore::new(dir.path());
        store.ensure_layout().unwrap();

        let mut budget = TokenBudget::load(&store, 10_000);
        assert!(budget.allows(4_000));
        budget.charge(9_000);
        budget.save(&store).unwrap();

        let mut reloaded = TokenBudget::load(&store, 10_000);
        assert_eq!(reloaded.tokens_used, 9_000);
        assert!(!reloaded.allows(4_000));
        assert_eq!(reloaded.remaining(), 1_000);
    }

    #[test]
    fn stale_budget_day_resets() {
        let dir = tempdir().unwrap();
        let store = WorkStore::new(dir.path());
        store.ensure_layout().unwrap();

        let old = TokenBudget {
            day: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            tokens_used: 99_999,
            limit: 10_000,
        };
        old.save(&store).unwrap();

        let mut budget = TokenBudget::load(&store, 10_000);
        assert!(budget.allows(4_000));
        assert_eq!(budget.tokens_used, 0);
    }
}
