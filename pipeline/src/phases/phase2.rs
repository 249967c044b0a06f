//! Phase 2: hierarchical local inference over the phase-1 failure stream.
//!
//! The escalation ladder is an explicit state machine over three model
//! tiers: the small model proposes, the medium model confirms, and the
//! large model arbitrates only when the first two disagree. Agreement
//! compares the assigned kind; field values come from the earliest
//! successful model.

use std::{fs, time::Duration};

use chrono::Utc;

use lib_field_extract::EmailMeta;

use crate::classify::DocumentKind;
use crate::config::InferenceConfig;
use crate::error::PipelineResult;
use crate::mail;
use crate::prompt::{InferenceBackend, ModelError, ModelVerdict};
use crate::store::claim::{claim, ClaimOutcome};
use crate::store::scan::InputItem;
use crate::store::{Artifact, FailReason, FailureRecord};

use super::{FsErrorStreak, PhaseStats, WorkerCtx};

use crate::phases::phase1::{content_md5, hex_sha256};

#[derive(Debug, Clone)]
pub struct ModelTier {
    pub name: String,
    pub timeout: Duration,
}

pub struct EscalationLadder {
    pub small: ModelTier,
    pub medium: ModelTier,
    pub large: ModelTier,
}

impl EscalationLadder {
    pub fn from_config(cfg: &InferenceConfig) -> Self {
        EscalationLadder {
            small: ModelTier {
                name: cfg.small_model.clone(),
                timeout: Duration::from_secs(cfg.small_timeout_secs),
            },
            medium: ModelTier {
                name: cfg.medium_model.clone(),
                timeout: Duration::from_secs(cfg.medium_timeout_secs),
            },
            large: ModelTier {
                name: cfg.large_model.clone(),
                timeout: Duration::from_secs(cfg.large_timeout_secs),
            },
        }
    }
}

/// Terminal state of one escalation run.
#[derive(Debug)]
pub enum EscalationOutcome {
    Done {
        verdict: ModelVerdict,
        /// Kind verdicts of every consulted model, for post-hoc analysis.
        /// Present only when more than one model had to be consulted beyond
        /// the confirmation step.
        trace: Vec<String>,
        escalated: bool,
    },
    Failed {
        reason: FailReason,
        trace: Vec<String>,
    },
}

/// Run the SMALL -> MEDIUM -> LARGE ladder for one item.
pub async fn run_escalation<B: InferenceBackend + ?Sized>(
    backend: &B,
    ladder: &EscalationLadder,
    meta: &EmailMeta,
    text: &str,
) -> EscalationOutcome {
    let mut trace: Vec<String> = Vec::new();

    // SMALL proposes; a timeout or garbled answer still moves to MEDIUM.
    let small = match backend
        .classify(&ladder.small.name, ladder.small.timeout, meta, text)
        .await
    {
        Ok(reply) => {
            trace.push(reply.verdict.doc_kind.to_string());
            Some(reply.verdict)
        }
        Err(e) => {
            tracing::debug!("small model failed: {e}");
            trace.push("-".to_string());
            None
        }
    };

    // MEDIUM confirms.
    let medium = match backend
        .classify(&ladder.medium.name, ladder.medium.timeout, meta, text)
        .await
    {
        Ok(reply) => {
            trace.push(reply.verdict.doc_kind.to_string());
            Some(reply.verdict)
        }
        Err(e) => {
            tracing::debug!("medium model failed: {e}");
            trace.push("-".to_string());
            None
        }
    };

    let mut disagreement = false;
    match (&small, &medium) {
        (Some(s), Some(m)) if s.doc_kind == m.doc_kind => {
            return EscalationOutcome::Done {
                verdict: s.clone(),
                trace,
                escalated: false,
            };
        }
        (Some(_), Some(_)) => {
            disagreement = true;
        }
        _ => {}
    }

    // LARGE arbitrates.
    match backend
        .classify(&ladder.large.name, ladder.large.timeout, meta, text)
        .await
    {
        Ok(reply) => {
            trace.push(reply.verdict.doc_kind.to_string());
            EscalationOutcome::Done {
                verdict: reply.verdict,
                trace,
                escalated: true,
            }
        }
        Err(e) => {
            trace.push("-".to_string());
            let reason = if disagreement {
                FailReason::ModelDisagreementUnresolved
            } else {
                match e {
                    ModelError::Timeout => FailReason::ModelTimeout,
                    _ => FailReason::ModelUnparseable,
                }
            };
            EscalationOutcome::Failed { reason, trace }
        }
    }
}

pub struct Phase2Worker<B> {
    backend: B,
    ladder: EscalationLadder,
}

impl<B: InferenceBackend> Phase2Worker<B> {
    pub fn new(backend: B, ladder: EscalationLadder) -> Self {
        Phase2Worker { backend, ladder }
    }

    /// Consume a slice of the phase-1 failure stream in arrival order.
    pub async fn run(
        &self,
        ctx: &mut WorkerCtx,
        records: &[FailureRecord],
        items_by_id: &dyn Fn(&str) -> Option<InputItem>,
    ) -> PipelineResult<PhaseStats> {
        let mut stats = PhaseStats::new(2, ctx.instance);
        let mut fs_errors = FsErrorStreak::default();

        tracing::info!(
            "phase 2 instance {} starting: {} failure records",
            ctx.instance,
            records.len()
        );

        for record in records {
            if !ctx.checkpoint().await {
                break;
            }

            let guard = match claim(&ctx.store, 2, &record.item_id, &ctx.host, ctx.stale_lock_ttl)
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
            match self.process_record(ctx, record, items_by_id).await {
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
    ) -> PipelineResult<Option<DocumentKind>> {
        // Re-read the envelope; the failure snippet alone is too little
        // context for the models.
        let (meta, text, item) = match items_by_id(&record.item_id) {
            Some(item) => match item.eml_path() {
                Some(path) => {
                    let raw = fs::read(&path)?;
                    match mail::parse_eml(&raw) {
                        Ok(parsed) => {
                            let body = if parsed.envelope.body.is_empty() {
                                record.snippet.clone()
                            } else {
                                parsed.envelope.body.clone()
                            };
                            (parsed.envelope.meta(), body, Some(item))
                        }
                        Err(_) => (EmailMeta::default(), record.snippet.clone(), Some(item)),
                    }
                }
                None => (EmailMeta::default(), record.snippet.clone(), Some(item)),
            },
            None => (EmailMeta::default(), record.snippet.clone(), None),
        };

        match run_escalation(&self.backend, &self.ladder, &meta, &text).await {
            EscalationOutcome::Done {
                verdict,
                trace,
                escalated,
            } => {
                let mut fields = verdict.fields.clone();
                // Envelope metadata is authoritative over model output.
                fields.set_str("email_from", meta.from.clone());
                fields.set_str("email_to", meta.to.clone());
                fields.set_str("email_subject", meta.subject.clone());

                let content_hash = match &item {
                    Some(item) => content_md5(item)?,
                    None => String::new(),
                };

                let artifact = Artifact {
                    item_id: record.item_id.clone(),
                    phase: 2,
                    doc_kind: verdict.doc_kind,
                    fields,
                    raw_text_sha256: hex_sha256(&text),
                    content_md5: content_hash,
                    confidence: verdict.confidence,
                    escalation_trace: escalated.then_some(trace),
                    timestamp: Utc::now(),
                };

                if verdict.doc_kind.is_accounting() {
                    let data =
                        lib_isdoc::InvoiceData::from_fields(&record.item_id, &artifact.fields);
                    ctx.store
                        .write_xml(&record.item_id, &lib_isdoc::render(&data))?;
                }

                ctx.store.write_artifact(&artifact)?;
                Ok(Some(verdict.doc_kind))
            }
            EscalationOutcome::Failed { reason, trace } => {
                tracing::debug!("{} escalation failed: {trace:?}", record.item_id);
                ctx.store
                    .append_failure(&FailureRecord::new(&record.item_id, 2, reason, &text))?;
                Ok(None)
            }
        }
    }
}
