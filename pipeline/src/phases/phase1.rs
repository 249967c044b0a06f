//! Phase 1: envelope parsing, attachment OCR, rule classification, field
//! extraction and structured-payload emission.
//!
//! No model inference happens here; everything the rule tables cannot
//! resolve is appended to the phase-2 input stream.

use std::fs;

use chrono::Utc;
use futures::{stream, StreamExt};
use md5::Md5;
use sha2::{Digest, Sha256};

use lib_field_extract as field_extract;

use crate::classify::{Classifier, DocumentKind};
use crate::error::{PipelineError, PipelineResult};
use crate::mail::{self, ParsedItem};
use crate::ocr::{OcrClient, OcrError};
use crate::store::claim::{claim, ClaimOutcome};
use crate::store::scan::InputItem;
use crate::store::{Artifact, FailReason, FailureRecord};

use super::{FsErrorStreak, PhaseStats, WorkerCtx};

/// Items with less extracted text than this cannot be classified reliably.
const MIN_TEXT_CHARS: usize = 100;
/// Attachment OCR fan-out per item.
const OCR_CONCURRENCY: usize = 3;

enum ItemOutcome {
    Done(DocumentKind),
    Failed(FailReason, String),
}

pub struct Phase1Worker {
    ocr: OcrClient,
    classifier: Classifier,
}

impl Phase1Worker {
    pub fn new(ocr: OcrClient, classifier: Classifier) -> Self {
        Phase1Worker { ocr, classifier }
    }

    /// Process the instance's index range in slot order.
    pub async fn run(&self, ctx: &mut WorkerCtx, items: &[InputItem]) -> PipelineResult<PhaseStats> {
        let mut stats = PhaseStats::new(1, ctx.instance);
        let mut fs_errors = FsErrorStreak::default();

        tracing::info!(
            "phase 1 instance {} starting: {} items",
            ctx.instance,
            items.len()
        );

        for item in items {
            if !ctx.checkpoint().await {
                tracing::info!("phase 1 instance {} stopping on signal", ctx.instance);
                break;
            }

            let guard = match claim(&ctx.store, 1, &item.item_id, &ctx.host, ctx.stale_lock_ttl) {
                Ok(ClaimOutcome::Claimed(guard)) => guard,
                Ok(ClaimOutcome::Contended) | Ok(ClaimOutcome::AlreadyDone) => {
                    stats.skipped += 1;
                    continue;
                }
                Err(e) => {
                    fs_errors.record(&item.item_id, &e.into())?;
                    continue;
                }
            };

            stats.processed += 1;
            match self.process_item(ctx, item).await {
                Ok(ItemOutcome::Done(kind)) => {
                    stats.succeeded += 1;
                    stats.count_kind(kind);
                    fs_errors.clear();
                }
                Ok(ItemOutcome::Failed(reason, text)) => {
                    let record = FailureRecord::new(&item.item_id, 1, reason, &text);
                    if let Err(e) = ctx.store.append_failure(&record) {
                        fs_errors.record(&item.item_id, &e)?;
                    } else {
                        stats.failed += 1;
                        fs_errors.clear();
                    }
                }
                Err(e) => {
                    // Unexpected I/O problem; roll back and continue.
                    fs_errors.record(&item.item_id, &e)?;
                }
            }

            if let Err(e) = guard.release() {
                tracing::warn!("failed to release lock for {}: {e}", item.item_id);
            }
        }

        if let Err(e) = stats.save(ctx) {
            tracing::warn!("could not persist stats: {e}");
        }
        stats.log_summary();
        Ok(stats)
    }

    async fn process_item(
        &self,
        ctx: &WorkerCtx,
        item: &InputItem,
    ) -> PipelineResult<ItemOutcome> {
        let Some(eml_path) = item.eml_path() else {
            return Ok(ItemOutcome::Failed(
                FailReason::OcrError,
                format!("no eml file in {}", item.dir.display()),
            ));
        };
        let raw = fs::read(&eml_path)?;
        let parsed = match mail::parse_eml(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(ItemOutcome::Failed(
                    FailReason::OcrError,
                    format!("eml parse error: {e}"),
                ));
            }
        };

        let sender = parsed.envelope.sender_address().to_string();

        // Notification senders short-circuit before OCR and the text-length
        // gate; their bodies are often tiny and their attachments are noise.
        let (kind, confidence) = self.classifier.classify(&sender, &parsed.envelope.body);
        if kind == DocumentKind::SystemNotification {
            return self
                .finish_item(ctx, item, &parsed, kind, confidence, &parsed.envelope.body)
                .await;
        }

        let (text, ocr_timed_out) = self.gather_text(&parsed).await;

        if text.chars().count() < MIN_TEXT_CHARS {
            let reason = if ocr_timed_out {
                FailReason::OcrTimeout
            } else {
                FailReason::OcrInsufficient
            };
            return Ok(ItemOutcome::Failed(reason, text));
        }

        let (kind, confidence) = self.classifier.classify(&sender, &text);
        if kind == DocumentKind::Unknown {
            return Ok(ItemOutcome::Failed(FailReason::Unclassified, text));
        }

        self.finish_item(ctx, item, &parsed, kind, confidence, &text)
            .await
    }

    async fn finish_item(
        &self,
        ctx: &WorkerCtx,
        item: &InputItem,
        parsed: &ParsedItem,
        kind: DocumentKind,
        confidence: f32,
        text: &str,
    ) -> PipelineResult<ItemOutcome> {
        let meta = parsed.envelope.meta();
        let fields = field_extract::extract_all(text, &meta, &kind.to_string());

        let artifact = Artifact {
            item_id: item.item_id.clone(),
            phase: 1,
            doc_kind: kind,
            fields,
            raw_text_sha256: hex_sha256(text),
            content_md5: content_md5(item)?,
            confidence,
            escalation_trace: None,
            timestamp: Utc::now(),
        };

        if kind.is_accounting() {
            let data = lib_isdoc::InvoiceData::from_fields(&item.item_id, &artifact.fields);
            ctx.store.write_xml(&item.item_id, &lib_isdoc::render(&data))?;
        }

        ctx.store.write_artifact(&artifact)?;
        tracing::debug!("{} -> {kind} ({confidence:.2})", item.item_id);
        Ok(ItemOutcome::Done(kind))
    }

    /// Envelope body plus OCR text of every attachment, with a bounded
    /// concurrent fan-out. Returns the combined text and whether any
    /// attachment hit the OCR timeout.
    async fn gather_text(&self, parsed: &ParsedItem) -> (String, bool) {
        let mut text = parsed.envelope.body.clone();
        let mut timed_out = false;

        let results: Vec<_> = stream::iter(parsed.attachments.iter())
            .map(|attachment| {
                let ocr = &self.ocr;
                async move {
                    let result = ocr
                        .extract(
                            &attachment.filename,
                            &attachment.content_type,
                            attachment.data.clone(),
                        )
                        .await;
                    (attachment.filename.clone(), result)
                }
            })
            .buffered(OCR_CONCURRENCY)
            .collect()
            .await;

        for (filename, result) in results {
            match result {
                Ok(ocr_text) => {
                    text.push_str("\n\n--- ");
                    text.push_str(&filename);
                    text.push_str(" ---\n\n");
                    text.push_str(&ocr_text.text);
                }
                Err(OcrError::Timeout) => {
                    tracing::warn!("ocr timeout on {filename}");
                    timed_out = true;
                }
                Err(e) => {
                    tracing::warn!("ocr failed on {filename}: {e}");
                }
            }
        }

        (text, timed_out)
    }
}

pub fn hex_sha256(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex(&hasher.finalize())
}

/// MD5 of the primary document bytes: the delivery dedup identity.
pub fn content_md5(item: &InputItem) -> PipelineResult<String> {
    let path = item.primary_blob().ok_or_else(|| {
        PipelineError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no primary blob in {}", item.dir.display()),
        ))
    })?;
    let data = fs::read(path)?;
    let mut hasher = Md5::new();
    hasher.update(&data);
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;

    use crate::classify::Classifier;
    use crate::config::OcrConfig;
    use crate::monitor::ResourceSnapshot;
    use crate::store::scan::enumerate_inputs;
    use crate::store::WorkStore;

    fn write_item(input: &std::path::Path, item_id: &str, eml: &str) {
        let dir = input.join(item_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("message.eml"), eml).unwrap();
    }

    fn eml(from: &str, subject: &str, body: &str) -> String {
        format!(
            "From: {from}\r\nTo: me@example.cz\r\nSubject: {subject}\r\n\
             MIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{body}"
        )
    }

    struct Rig {
        _dir: tempfile::TempDir,
        input: std::path::PathBuf,
        store: WorkStore,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        std::fs::create_dir_all(&input).unwrap();
        let store = WorkStore::new(dir.path().join("out"));
        store.ensure_layout().unwrap();
        Rig {
            _dir: dir,
            input,
            store,
        }
    }

    fn ctx(store: &WorkStore) -> WorkerCtx {
        let (_tx, rx) = watch::channel(ResourceSnapshot::default());
        // The sender is dropped; checkpoint treats a closed monitor as
        // unthrottled.
        WorkerCtx {
            store: store.clone(),
            machine: "test".to_string(),
            instance: 0,
            host: "test-host".to_string(),
            stale_lock_ttl: Duration::from_secs(600),
            throttle: rx,
            shutdown: CancellationToken::new(),
        }
    }

    fn worker() -> Phase1Worker {
        // The OCR endpoint is never reached: test items have no attachments.
        let ocr = OcrClient::new(
            reqwest::Client::new(),
            &OcrConfig {
                endpoint: "http://127.0.0.1:1/extract".to_string(),
                timeout_secs: 1,
                max_pages: 10,
            },
        );
        Phase1Worker::new(ocr, Classifier::new(&[]))
    }

    #[tokio::test]
    async fn notification_bypasses_later_phases() {
        let rig = rig();
        write_item(
            &rig.input,
            "loxone-report",
            &eml(
                "Loxone <noreply@loxone.com>",
                "Statistic report",
                "Weekly statistics attached to your dashboard account; no action needed from you.",
            ),
        );
        let items = enumerate_inputs(&rig.input).unwrap();

        let stats = worker().run(&mut ctx(&rig.store), &items).await.unwrap();

        assert_eq!(stats.succeeded, 1);
        let artifact = rig
            .store
            .read_artifact(&rig.store.artifact_path(1, "loxone-report"))
            .unwrap();
        assert_eq!(artifact.doc_kind, DocumentKind::SystemNotification);
        assert_eq!(artifact.phase, 1);
        assert!((artifact.confidence - 0.99).abs() < f32::EPSILON);
        // Never enters phase 2.
        assert_eq!(rig.store.failure_count(1), 0);
    }

    #[tokio::test]
    async fn invoice_body_produces_artifact_and_xml() {
        let rig = rig();
        let body = "Dobrý den,\r\n\
            zasíláme daňový doklad.\r\n\
            Faktura č. 2024-001\r\n\
            IČO: 12345678 DIČ: CZ12345678\r\n\
            Datum splatnosti: 29.12.2024\r\n\
            Celkem k úhradě: 1200,00 CZK\r\n\
            Variabilní symbol: 2024001\r\n\
            Dodavatel: ABC Software s.r.o.\r\n\
            Děkujeme za včasnou úhradu faktury, tým ABC Software.";
        write_item(
            &rig.input,
            "invoice-2024-001",
            &eml("fakturace@abc.cz", "Faktura 2024-001", body),
        );
        let items = enumerate_inputs(&rig.input).unwrap();

        let stats = worker().run(&mut ctx(&rig.store), &items).await.unwrap();

        assert_eq!(stats.succeeded, 1);
        let artifact = rig
            .store
            .read_artifact(&rig.store.artifact_path(1, "invoice-2024-001"))
            .unwrap();
        assert_eq!(artifact.doc_kind, DocumentKind::Invoice);
        assert_eq!(artifact.fields.get_str("cislo_dokumentu"), Some("2024-001"));
        assert_eq!(artifact.fields.get_str("protistrana_ico"), Some("12345678"));
        assert!(!artifact.content_md5.is_empty());
        assert_eq!(artifact.raw_text_sha256.len(), 64);
        // Accounting kind gets the structured payload.
        assert!(rig.store.xml_dir().join("invoice-2024-001.xml").exists());
    }

    #[tokio::test]
    async fn short_text_goes_to_phase_two_stream() {
        let rig = rig();
        write_item(
            &rig.input,
            "tiny",
            &eml("someone@example.cz", "hi", "short"),
        );
        let items = enumerate_inputs(&rig.input).unwrap();

        let stats = worker().run(&mut ctx(&rig.store), &items).await.unwrap();

        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.failed, 1);
        let failures = rig.store.read_failures(1).unwrap();
        assert_eq!(failures[0].item_id, "tiny");
        assert_eq!(failures[0].reason, FailReason::OcrInsufficient);
        assert!(!rig.store.has_artifact("tiny"));
    }

    #[tokio::test]
    async fn unclassifiable_text_fails_as_unclassified() {
        let rig = rig();
        let noise = "lorem ipsum dolor sit amet ".repeat(10);
        write_item(
            &rig.input,
            "noise",
            &eml("someone@example.cz", "???", &noise),
        );
        let items = enumerate_inputs(&rig.input).unwrap();

        worker().run(&mut ctx(&rig.store), &items).await.unwrap();

        let failures = rig.store.read_failures(1).unwrap();
        assert_eq!(failures[0].reason, FailReason::Unclassified);
    }

    #[tokio::test]
    async fn rerun_skips_completed_items() {
        let rig = rig();
        write_item(
            &rig.input,
            "loxone-report",
            &eml(
                "noreply@loxone.com",
                "Statistic report",
                "Weekly statistics attached to your dashboard account; no action needed from you.",
            ),
        );
        let items = enumerate_inputs(&rig.input).unwrap();

        let first = worker().run(&mut ctx(&rig.store), &items).await.unwrap();
        assert_eq!(first.succeeded, 1);

        let second = worker().run(&mut ctx(&rig.store), &items).await.unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 1);
    }

    #[test]
    fn sha256_is_stable_hex() {
        let digest = hex_sha256("faktura");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hex_sha256("faktura"));
        assert_ne!(digest, hex_sha256("Faktura"));
    }

    #[test]
    fn content_md5_follows_primary_blob() {
        let dir = tempfile::tempdir().unwrap();
        let item_dir = dir.path().join("item-1");
        std::fs::create_dir(&item_dir).unwrap();
        std::fs::write(item_dir.join("message.eml"), b"eml bytes").unwrap();

        let item = InputItem {
            item_id: "item-1".to_string(),
            slot: 0,
            dir: item_dir.clone(),
        };
        let eml_hash = content_md5(&item).unwrap();
        assert_eq!(eml_hash.len(), 32);

        // Adding a PDF changes the primary blob and therefore the identity.
        std::fs::write(item_dir.join("a.pdf"), b"pdf bytes").unwrap();
        let pdf_hash = content_md5(&item).unwrap();
        assert_ne!(eml_hash, pdf_hash);
    }
}
