//! Shared work store: the filesystem tree every host coordinates through.
//!
//! Layout under the output root:
//!
//! ```text
//! results/phase{1..4}/<item_id>.json    artifacts, one writer each
//! failed/phase{1..4}.jsonl              failure streams, append-only
//! failed/phase3_deferred.jsonl          budget-deferred items
//! locks/phase{1..4}/<item_id>           claim locks, exclusive-create
//! xml/<item_id>.xml                     structured accounting payloads
//! markers/phase{N}.done                 failure stream fully consumed
//! markers/phase3_budget.json            external-model budget state
//! run/<machine>/                        pid and stats files per instance
//! ```
//!
//! Artifacts are published with write-temp-then-rename so readers never see
//! a partial file. Failure records stay under 4 KiB so a single `O_APPEND`
//! write is atomic on the shared filesystem.

pub mod claim;
pub mod scan;

use std::{
    collections::HashSet,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use lib_field_extract::FieldSet;

use crate::classify::DocumentKind;
use crate::error::PipelineResult;

pub const PHASES: [u8; 4] = [1, 2, 3, 4];

/// Failure records above this size would no longer append atomically.
const MAX_FAILURE_RECORD_BYTES: usize = 4096;
const SNIPPET_CHARS: usize = 500;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailReason {
    OcrInsufficient,
    OcrTimeout,
    OcrError,
    Unclassified,
    ModelTimeout,
    ModelUnparseable,
    ModelDisagreementUnresolved,
    RateLimited,
    QuotaExhausted,
    DeliveryFatal,
    FsError,
}

/// Per-item success record; exactly one exists across all phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub item_id: String,
    pub phase: u8,
    pub doc_kind: DocumentKind,
    pub fields: FieldSet,
    pub raw_text_sha256: String,
    pub content_md5: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_trace: Option<Vec<String>>,
    pub timestamp: DateTime<Utc>,
}

/// One line of a phase failure stream; becomes the next phase's input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub item_id: String,
    pub phase: u8,
    pub reason: FailReason,
    pub snippet: String,
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(item_id: &str, phase: u8, reason: FailReason, text: &str) -> Self {
        FailureRecord {
            item_id: item_id.to_string(),
            phase,
            reason,
            snippet: text.chars().take(SNIPPET_CHARS).collect(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkStore {
    root: PathBuf,
}

impl WorkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the full directory layout. Safe to call from every instance.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for phase in PHASES {
            fs::create_dir_all(self.results_dir(phase))?;
            fs::create_dir_all(self.locks_dir(phase))?;
        }
        fs::create_dir_all(self.root.join("failed"))?;
        fs::create_dir_all(self.xml_dir())?;
        fs::create_dir_all(self.markers_dir())?;
        fs::create_dir_all(self.root.join("run"))?;
        Ok(())
    }

    pub fn results_dir(&self, phase: u8) -> PathBuf {
        self.root.join("results").join(format!("phase{phase}"))
    }

    pub fn locks_dir(&self, phase: u8) -> PathBuf {
        self.root.join("locks").join(format!("phase{phase}"))
    }

    pub fn failure_file(&self, phase: u8) -> PathBuf {
        self.root.join("failed").join(format!("phase{phase}.jsonl"))
    }

    pub fn deferred_file(&self) -> PathBuf {
        self.root.join("failed").join("phase3_deferred.jsonl")
    }

    pub fn xml_dir(&self) -> PathBuf {
        self.root.join("xml")
    }

    pub fn markers_dir(&self) -> PathBuf {
        self.root.join("markers")
    }

    pub fn run_dir(&self, machine: &str) -> PathBuf {
        self.root.join("run").join(machine)
    }

    pub fn artifact_path(&self, phase: u8, item_id: &str) -> PathBuf {
        self.results_dir(phase).join(format!("{item_id}.json"))
    }

    /// True when any phase up to and including `phase` already produced an
    /// artifact for the item.
    pub fn has_artifact_up_to(&self, phase: u8, item_id: &str) -> bool {
        PHASES
            .iter()
            .filter(|p| **p <= phase)
            .any(|p| self.artifact_path(*p, item_id).exists())
    }

    pub fn has_artifact(&self, item_id: &str) -> bool {
        self.has_artifact_up_to(4, item_id)
    }

    /// Publish an artifact with write-temp-then-rename. On any error the
    /// partial temp file is removed so no half-written result is visible.
    pub fn write_artifact(&self, artifact: &Artifact) -> PipelineResult<()> {
        let path = self.artifact_path(artifact.phase, &artifact.item_id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(artifact)?;
        if let Err(e) = fs::write(&tmp, payload).and_then(|_| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn read_artifact(&self, path: &Path) -> PipelineResult<Artifact> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// All artifacts across phases 1..=4, earliest phase winning when an id
    /// somehow appears twice.
    pub fn all_artifacts(&self) -> PipelineResult<Vec<Artifact>> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut artifacts = Vec::new();
        for phase in PHASES {
            let dir = self.results_dir(phase);
            if !dir.is_dir() {
                continue;
            }
            let mut entries: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            entries.sort();
            for path in entries {
                match self.read_artifact(&path) {
                    Ok(artifact) => {
                        if seen.insert(artifact.item_id.clone()) {
                            artifacts.push(artifact);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("skipping unreadable artifact {}: {e}", path.display());
                    }
                }
            }
        }
        Ok(artifacts)
    }

    pub fn artifact_count(&self, phase: u8) -> usize {
        fs::read_dir(self.results_dir(phase))
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Append one record to a phase failure stream. The serialized line must
    /// stay below the atomic-append bound.
    pub fn append_failure(&self, record: &FailureRecord) -> PipelineResult<()> {
        self.append_record(&self.failure_file(record.phase), record)
    }

    pub fn append_deferred(&self, record: &FailureRecord) -> PipelineResult<()> {
        self.append_record(&self.deferred_file(), record)
    }

    fn append_record(&self, path: &Path, record: &FailureRecord) -> PipelineResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        debug_assert!(line.len() <= MAX_FAILURE_RECORD_BYTES);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn read_failures(&self, phase: u8) -> PipelineResult<Vec<FailureRecord>> {
        Self::read_stream(&self.failure_file(phase))
    }

    pub fn read_deferred(&self) -> PipelineResult<Vec<FailureRecord>> {
        Self::read_stream(&self.deferred_file())
    }

    fn read_stream(path: &Path) -> PipelineResult<Vec<FailureRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(path)?;
        let mut records = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("skipping malformed failure record: {e}"),
            }
        }
        Ok(records)
    }

    pub fn failure_count(&self, phase: u8) -> usize {
        fs::read_to_string(self.failure_file(phase))
            .map(|s| s.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0)
    }

    pub fn deferred_count(&self) -> usize {
        fs::read_to_string(self.deferred_file())
            .map(|s| s.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0)
    }

    pub fn write_phase_done_marker(&self, phase: u8) -> std::io::Result<()> {
        fs::write(self.markers_dir().join(format!("phase{phase}.done")), b"")
    }

    pub fn phase_done(&self, phase: u8) -> bool {
        self.markers_dir().join(format!("phase{phase}.done")).exists()
    }

    pub fn write_xml(&self, item_id: &str, xml: &str) -> std::io::Result<()> {
        fs::write(self.xml_dir().join(format!("{item_id}.xml")), xml)
    }

    pub fn budget_path(&self) -> PathBuf {
        self.markers_dir().join("phase3_budget.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn test_artifact(item_id: &str, phase: u8) -> Artifact {
        Artifact {
            item_id: item_id.to_string(),
            phase,
            doc_kind: DocumentKind::Invoice,
            fields: FieldSet::default(),
            raw_text_sha256: "0".repeat(64),
            content_md5: "0".repeat(32),
            confidence: 0.9,
            escalation_trace: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn artifact_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let store = WorkStore::new(dir.path());
        store.ensure_layout().unwrap();

        let artifact = test_artifact("item-1", 1);
        store.write_artifact(&artifact).unwrap();

        let read = store
            .read_artifact(&store.artifact_path(1, "item-1"))
            .unwrap();
        assert_eq!(read.item_id, "item-1");
        assert_eq!(read.doc_kind, DocumentKind::Invoice);
        assert_eq!(read.fields.0.len(), 31);
        // No temp file left behind.
        assert!(!store.artifact_path(1, "item-1").with_extension("json.tmp").exists());
    }

    #[test]
    fn artifact_in_earlier_phase_blocks_later_claims() {
        let dir = tempdir().unwrap();
        let store = WorkStore::new(dir.path());
        store.ensure_layout().unwrap();

        store.write_artifact(&test_artifact("item-1", 1)).unwrap();

        assert!(store.has_artifact_up_to(1, "item-1"));
        assert!(store.has_artifact_up_to(3, "item-1"));
        assert!(!store.has_artifact_up_to(3, "item-2"));
    }

    #[test]
    fn failure_stream_appends_and_reads_in_order() {
        let dir = tempdir().unwrap();
        let store = WorkStore::new(dir.path());
        store.ensure_layout().unwrap();

        for i in 0..5 {
            let record = FailureRecord::new(
                &format!("item-{i}"),
                1,
                FailReason::OcrInsufficient,
                "short text",
            );
            store.append_failure(&record).unwrap();
        }

        let records = store.read_failures(1).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].item_id, "item-0");
        assert_eq!(records[4].item_id, "item-4");
        assert_eq!(store.failure_count(1), 5);
    }

    #[test]
    fn failure_snippet_is_bounded() {
        let long_text = "x".repeat(10_000);
        let record = FailureRecord::new("item-1", 2, FailReason::ModelTimeout, &long_text);
        assert_eq!(record.snippet.chars().count(), 500);
        let line = serde_json::to_string(&record).unwrap();
        assert!(line.len() <= MAX_FAILURE_RECORD_BYTES);
    }

    #[test]
    fn all_artifacts_dedups_across_phases() {
        let dir = tempdir().unwrap();
        let store = WorkStore::new(dir.path());
        store.ensure_layout().unwrap();

        store.write_artifact(&test_artifact("a", 1)).unwrap();
        store.write_artifact(&test_artifact("b", 2)).unwrap();
        // Should never happen, but the union must still be unique per item.
        store.write_artifact(&test_artifact("a", 3)).unwrap();

        let all = store.all_artifacts().unwrap();
        assert_eq!(all.len(), 2);
        let a = all.iter().find(|x| x.item_id == "a").unwrap();
        assert_eq!(a.phase, 1);
    }

    #[test]
    fn fail_reason_serializes_snake_case() {
        let json = serde_json::to_string(&FailReason::OcrInsufficient).unwrap();
        assert_eq!(json, "\"ocr_insufficient\"");
        assert_eq!(FailReason::ModelTimeout.to_string(), "model_timeout");
    }

    #[test]
    fn done_marker_round_trips() {
        let dir = tempdir().unwrap();
        let store = WorkStore::new(dir.path());
        store.ensure_layout().unwrap();

        assert!(!store.phase_done(1));
        store.write_phase_done_marker(1).unwrap();
        assert!(store.phase_done(1));
    }
}
