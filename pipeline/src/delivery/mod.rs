//! Phase 5: idempotent delivery to the document-management service.
//!
//! Per artifact: dedup by content hash, resolve the correspondent through
//! the normalizer, resolve tags and document type, upload the primary blob,
//! patch the 31 custom fields. Every create path is lookup-first, so
//! replaying the same artifact set changes nothing.

pub mod api;
pub mod merger;

use std::{fs, future::Future, time::Duration};

use futures::{stream, StreamExt};
use serde_json::Value;

use lib_field_extract::{field_type, FieldType, FIELD_NAMES};

use crate::config::{DeliveryConfig, RetryConfig};
use crate::error::PipelineResult;
use crate::normalizer::Normalizer;
use crate::store::scan::InputItem;
use crate::store::{Artifact, FailReason, FailureRecord, WorkStore};

use api::{DeliveryError, DeliveryResult, DocumentsApi, UploadOutcome};

#[derive(Debug, Default, Clone)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub duplicates: u64,
    pub patched: u64,
    pub failed: u64,
}

enum ItemResult {
    Uploaded,
    DuplicatePatched,
    Failed,
}

pub struct Deliverer<'a, A> {
    api: &'a A,
    store: &'a WorkStore,
    normalizer: &'a Normalizer,
    retry: RetryConfig,
    fan_out: usize,
}

impl<'a, A: DocumentsApi> Deliverer<'a, A> {
    pub fn new(
        api: &'a A,
        store: &'a WorkStore,
        normalizer: &'a Normalizer,
        cfg: &DeliveryConfig,
    ) -> Self {
        Deliverer {
            api,
            store,
            normalizer,
            retry: cfg.retry.clone(),
            fan_out: cfg.fan_out.max(1),
        }
    }

    /// Deliver the union of artifacts from phases 1-4.
    pub async fn deliver_all(
        &self,
        artifacts: &[Artifact],
        items_by_id: &(dyn Fn(&str) -> Option<InputItem> + Sync),
    ) -> PipelineResult<DeliveryStats> {
        tracing::info!("delivering {} artifacts", artifacts.len());

        // Custom fields exist before the first patch touches them.
        for name in FIELD_NAMES {
            self.with_retry(|| {
                self.api
                    .get_or_create_custom_field(name, data_type_name(name))
            })
            .await
            .map_err(|e| anyhow::anyhow!("custom field bootstrap failed: {e}"))?;
        }

        let results: Vec<ItemResult> = stream::iter(artifacts.iter())
            .map(|artifact| async move {
                match self.deliver_one(artifact, items_by_id).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!("delivery failed for {}: {e}", artifact.item_id);
                        if matches!(e, DeliveryError::Fatal(_)) {
                            let record = FailureRecord::new(
                                &artifact.item_id,
                                5,
                                FailReason::DeliveryFatal,
                                &e.to_string(),
                            );
                            if let Err(e) = self.store.append_failure(&record) {
                                tracing::error!("could not record delivery failure: {e}");
                            }
                        }
                        ItemResult::Failed
                    }
                }
            })
            .buffer_unordered(self.fan_out)
            .collect()
            .await;

        let mut stats = DeliveryStats::default();
        for result in results {
            match result {
                ItemResult::Uploaded => {
                    stats.delivered += 1;
                    stats.patched += 1;
                }
                ItemResult::DuplicatePatched => {
                    stats.duplicates += 1;
                    stats.patched += 1;
                }
                ItemResult::Failed => stats.failed += 1,
            }
        }
        tracing::info!(
            "delivery done: {} uploaded, {} duplicates, {} failed",
            stats.delivered,
            stats.duplicates,
            stats.failed
        );
        Ok(stats)
    }

    async fn deliver_one(
        &self,
        artifact: &Artifact,
        items_by_id: &(dyn Fn(&str) -> Option<InputItem> + Sync),
    ) -> DeliveryResult<ItemResult> {
        // 1. Content dedup.
        let existing = if artifact.content_md5.is_empty() {
            None
        } else {
            self.with_retry(|| self.api.find_document_by_hash(&artifact.content_md5))
                .await?
        };
        if let Some(document_id) = existing {
            self.patch_fields(document_id, artifact).await?;
            return Ok(ItemResult::DuplicatePatched);
        }

        // 2. Correspondent.
        let correspondent = match correspondent_name(artifact) {
            Some(raw) => Some(self.resolve_correspondent(&raw).await?),
            None => None,
        };

        // 3. Tags and document type.
        let kind_label = artifact.doc_kind.czech_label();
        let mut tags = vec![self.with_retry(|| self.api.get_or_create_tag(kind_label)).await?];
        if let Some(category) = artifact.fields.get_str("kategorie") {
            tags.push(
                self.with_retry(|| self.api.get_or_create_tag(category))
                    .await?,
            );
        }
        let document_type = self
            .with_retry(|| self.api.get_or_create_document_type(kind_label))
            .await?;

        // 4. Upload, then patch fields.
        let item = items_by_id(&artifact.item_id).ok_or_else(|| {
            DeliveryError::Fatal(format!("no input item for {}", artifact.item_id))
        })?;
        let blob_path = item.primary_blob().ok_or_else(|| {
            DeliveryError::Fatal(format!("no primary blob for {}", artifact.item_id))
        })?;
        let bytes = fs::read(&blob_path)
            .map_err(|e| DeliveryError::Fatal(format!("cannot read blob: {e}")))?;
        let filename = blob_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document.bin")
            .to_string();
        let title = title_for(artifact);

        let outcome = self
            .with_retry(|| {
                self.api.upload_document(
                    &filename,
                    bytes.clone(),
                    &title,
                    correspondent,
                    Some(document_type),
                    &tags,
                )
            })
            .await?;

        match outcome {
            UploadOutcome::Created(document_id) if document_id > 0 => {
                self.patch_fields(document_id, artifact).await?;
                Ok(ItemResult::Uploaded)
            }
            UploadOutcome::Created(_) => {
                // Async ingest: the service acknowledged without an id; the
                // fields are patched on a later redelivery pass when the
                // hash query resolves.
                Ok(ItemResult::Uploaded)
            }
            UploadOutcome::Duplicate => {
                if let Some(document_id) = self
                    .with_retry(|| self.api.find_document_by_hash(&artifact.content_md5))
                    .await?
                {
                    self.patch_fields(document_id, artifact).await?;
                }
                Ok(ItemResult::DuplicatePatched)
            }
        }
    }

    async fn resolve_correspondent(&self, raw: &str) -> DeliveryResult<u64> {
        let display = self.normalizer.best_display_name(raw);
        if let Some(existing) = self
            .with_retry(|| self.api.find_correspondent(&display))
            .await?
        {
            return Ok(existing.id);
        }
        let created = self
            .with_retry(|| self.api.create_correspondent(&display))
            .await?;
        Ok(created.id)
    }

    async fn patch_fields(&self, document_id: u64, artifact: &Artifact) -> DeliveryResult<()> {
        let mut payload: Vec<(u64, Value)> = Vec::new();
        for name in FIELD_NAMES {
            let Some(value) = artifact.fields.get(name) else {
                continue;
            };
            let Some(converted) = convert_field(name, value) else {
                continue;
            };
            let field_id = self
                .with_retry(|| self.api.get_or_create_custom_field(name, data_type_name(name)))
                .await?;
            payload.push((field_id, converted));
        }
        if payload.is_empty() {
            return Ok(());
        }
        self.with_retry(|| self.api.patch_custom_fields(document_id, &payload))
            .await
    }

    /// Retry transient errors with exponential backoff; conflicts and fatal
    /// errors pass straight through.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> DeliveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DeliveryResult<T>>,
    {
        let mut last = None;
        for attempt in 0..self.retry.attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(DeliveryError::Transient(e)) => {
                    tracing::warn!("transient delivery error (attempt {}): {e}", attempt + 1);
                    last = Some(DeliveryError::Transient(e));
                    if attempt + 1 < self.retry.attempts {
                        tokio::time::sleep(Duration::from_secs(self.retry.backoff_secs(attempt)))
                            .await;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(last.unwrap_or_else(|| DeliveryError::Transient("retries exhausted".to_string())))
    }
}

fn title_for(artifact: &Artifact) -> String {
    let title = artifact
        .fields
        .get_str("email_subject")
        .filter(|s| !s.is_empty())
        .or_else(|| artifact.fields.get_str("ai_summary"))
        .unwrap_or(&artifact.item_id);
    lib_field_extract::truncate(title, 128)
}

fn correspondent_name(artifact: &Artifact) -> Option<String> {
    artifact
        .fields
        .get_str("protistrana_nazev")
        .or_else(|| artifact.fields.get_str("od_firma"))
        .or_else(|| artifact.fields.get_str("od_osoba"))
        .or_else(|| artifact.fields.get_str("email_from"))
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
}

fn data_type_name(field: &str) -> &'static str {
    match field_type(field) {
        FieldType::String => "string",
        FieldType::Float => "float",
        FieldType::Date => "date",
    }
}

/// Coerce a field value to the delivery data type; unusable values are
/// dropped rather than failing the document.
fn convert_field(name: &str, value: &Value) -> Option<Value> {
    match field_type(name) {
        FieldType::String => match value {
            Value::String(s) if !s.is_empty() => Some(value.clone()),
            Value::Number(_) | Value::Bool(_) => Some(Value::String(value.to_string())),
            _ => None,
        },
        FieldType::Float => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => s
                .replace(',', ".")
                .parse::<f64>()
                .ok()
                .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number)),
            _ => None,
        },
        FieldType::Date => value.as_str().and_then(|s| {
            if s.len() >= 10 {
                Some(Value::String(s[..10].to_string()))
            } else {
                None
            }
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    use crate::classify::DocumentKind;
    use lib_field_extract::FieldSet;
    use super::api::RemoteCorrespondent;

    #[derive(Default)]
    pub struct MockState {
        pub documents: Vec<MockDocument>,
        pub correspondents: Vec<RemoteCorrespondent>,
        pub tags: HashMap<String, u64>,
        pub doc_types: HashMap<String, u64>,
        pub custom_fields: HashMap<String, u64>,
        pub uploads: u64,
        pub patches: u64,
        next_id: u64,
    }

    #[derive(Debug, Clone)]
    pub struct MockDocument {
        pub id: u64,
        pub checksum: String,
        pub correspondent: Option<u64>,
    }

    impl MockState {
        fn next_id(&mut self) -> u64 {
            self.next_id += 1;
            self.next_id
        }
    }

    /// In-memory stand-in for the document service.
    #[derive(Default)]
    pub struct MockApi {
        pub state: Mutex<MockState>,
        /// Checksum sent with the next upload; the real service computes it
        /// server-side from the blob.
        pub upload_checksum: Mutex<Option<String>>,
    }

    impl MockApi {
        pub fn set_upload_checksum(&self, checksum: &str) {
            *self.upload_checksum.lock().unwrap() = Some(checksum.to_string());
        }
    }

    #[async_trait]
    impl DocumentsApi for MockApi {
        async fn find_document_by_hash(&self, content_md5: &str) -> DeliveryResult<Option<u64>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .documents
                .iter()
                .find(|d| d.checksum == content_md5)
                .map(|d| d.id))
        }

        async fn upload_document(
            &self,
            _filename: &str,
            _bytes: Vec<u8>,
            _title: &str,
            correspondent: Option<u64>,
            _document_type: Option<u64>,
            _tags: &[u64],
        ) -> DeliveryResult<UploadOutcome> {
            let checksum = self
                .upload_checksum
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_default();
            let mut state = self.state.lock().unwrap();
            if state.documents.iter().any(|d| d.checksum == checksum) {
                return Ok(UploadOutcome::Duplicate);
            }
            state.uploads += 1;
            let id = state.next_id();
            state.documents.push(MockDocument {
                id,
                checksum,
                correspondent,
            });
            Ok(UploadOutcome::Created(id))
        }

        async fn patch_custom_fields(
            &self,
            _document_id: u64,
            _fields: &[(u64, Value)],
        ) -> DeliveryResult<()> {
            self.state.lock().unwrap().patches += 1;
            Ok(())
        }

        async fn find_correspondent(
            &self,
            name: &str,
        ) -> DeliveryResult<Option<RemoteCorrespondent>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .correspondents
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name))
                .cloned())
        }

        async fn create_correspondent(&self, name: &str) -> DeliveryResult<RemoteCorrespondent> {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id();
            let correspondent = RemoteCorrespondent {
                id,
                name: name.to_string(),
                document_count: 0,
            };
            state.correspondents.push(correspondent.clone());
            Ok(correspondent)
        }

        async fn list_correspondents(&self) -> DeliveryResult<Vec<RemoteCorrespondent>> {
            let state = self.state.lock().unwrap();
            let mut list = state.correspondents.clone();
            for c in &mut list {
                c.document_count = state
                    .documents
                    .iter()
                    .filter(|d| d.correspondent == Some(c.id))
                    .count() as u64;
            }
            Ok(list)
        }

        async fn delete_correspondent(&self, id: u64) -> DeliveryResult<()> {
            self.state
                .lock()
                .unwrap()
                .correspondents
                .retain(|c| c.id != id);
            Ok(())
        }

        async fn documents_for_correspondent(&self, id: u64) -> DeliveryResult<Vec<u64>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .documents
                .iter()
                .filter(|d| d.correspondent == Some(id))
                .map(|d| d.id)
                .collect())
        }

        async fn reassign_document(
            &self,
            document_id: u64,
            correspondent: u64,
        ) -> DeliveryResult<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(doc) = state.documents.iter_mut().find(|d| d.id == document_id) {
                doc.correspondent = Some(correspondent);
            }
            Ok(())
        }

        async fn rename_correspondent(&self, id: u64, name: &str) -> DeliveryResult<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(c) = state.correspondents.iter_mut().find(|c| c.id == id) {
                c.name = name.to_string();
            }
            Ok(())
        }

        async fn get_or_create_tag(&self, name: &str) -> DeliveryResult<u64> {
            let mut state = self.state.lock().unwrap();
            if let Some(id) = state.tags.get(name) {
                return Ok(*id);
            }
            let id = state.next_id();
            state.tags.insert(name.to_string(), id);
            Ok(id)
        }

        async fn get_or_create_document_type(&self, name: &str) -> DeliveryResult<u64> {
            let mut state = self.state.lock().unwrap();
            if let Some(id) = state.doc_types.get(name) {
                return Ok(*id);
            }
            let id = state.next_id();
            state.doc_types.insert(name.to_string(), id);
            Ok(id)
        }

        async fn get_or_create_custom_field(
            &self,
            name: &str,
            _data_type: &str,
        ) -> DeliveryResult<u64> {
            let mut state = self.state.lock().unwrap();
            if let Some(id) = state.custom_fields.get(name) {
                return Ok(*id);
            }
            let id = state.next_id();
            state.custom_fields.insert(name.to_string(), id);
            Ok(id)
        }
    }

    fn artifact(item_id: &str, hash: &str, sender: &str) -> Artifact {
        let mut fields = FieldSet::default();
        fields.set_str("email_subject", format!("Subject {item_id}"));
        fields.set_str("email_from", sender.to_string());
        fields.set_str("kategorie", "účetní");
        Artifact {
            item_id: item_id.to_string(),
            phase: 1,
            doc_kind: DocumentKind::Invoice,
            fields,
            raw_text_sha256: "0".repeat(64),
            content_md5: hash.to_string(),
            confidence: 0.9,
            escalation_trace: None,
            timestamp: Utc::now(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: WorkStore,
        input: std::path::PathBuf,
    }

    fn fixture(item_ids: &[&str]) -> Fixture {
        let dir = tempdir().unwrap();
        let store = WorkStore::new(dir.path().join("out"));
        store.ensure_layout().unwrap();
        let input = dir.path().join("input");
        std::fs::create_dir_all(&input).unwrap();
        for id in item_ids {
            let item_dir = input.join(id);
            std::fs::create_dir(&item_dir).unwrap();
            std::fs::write(item_dir.join("message.eml"), format!("mail {id}")).unwrap();
        }
        Fixture {
            _dir: dir,
            store,
            input,
        }
    }

    impl Fixture {
        fn lookup(&self) -> impl Fn(&str) -> Option<InputItem> + Sync + '_ {
            move |id: &str| {
                let dir = self.input.join(id);
                dir.is_dir().then(|| InputItem {
                    item_id: id.to_string(),
                    slot: 0,
                    dir,
                })
            }
        }
    }

    fn delivery_config() -> DeliveryConfig {
        DeliveryConfig {
            url: "http://localhost".to_string(),
            token: None,
            fan_out: 1,
            retry: RetryConfig {
                attempts: 2,
                initial_backoff_secs: 0,
                factor: 1,
                max_backoff_secs: 0,
            },
        }
    }

    #[tokio::test]
    async fn redelivery_creates_no_new_documents() {
        let ids: Vec<String> = (0..100).map(|i| format!("item-{i:03}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let fx = fixture(&id_refs);
        let api = MockApi::default();
        let normalizer = Normalizer::default();
        let cfg = delivery_config();
        let deliverer = Deliverer::new(&api, &fx.store, &normalizer, &cfg);

        let artifacts: Vec<Artifact> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| artifact(id, &format!("{i:032x}"), "Aukro <info@aukro.cz>"))
            .collect();

        // The mock derives its checksum from the artifact hash we deliver,
        // so pre-register each before its upload.
        for a in &artifacts {
            api.set_upload_checksum(&a.content_md5);
            let stats = deliverer.deliver_all(std::slice::from_ref(a), &fx.lookup()).await.unwrap();
            assert_eq!(stats.delivered, 1);
        }
        assert_eq!(api.state.lock().unwrap().documents.len(), 100);

        // Second run: all 100 hashes match, only patches are issued.
        let mut second = DeliveryStats::default();
        for a in &artifacts {
            api.set_upload_checksum(&a.content_md5);
            let stats = deliverer.deliver_all(std::slice::from_ref(a), &fx.lookup()).await.unwrap();
            second.delivered += stats.delivered;
            second.duplicates += stats.duplicates;
            second.patched += stats.patched;
        }
        assert_eq!(second.delivered, 0);
        assert_eq!(second.duplicates, 100);
        assert_eq!(second.patched, 100);
        assert_eq!(api.state.lock().unwrap().documents.len(), 100);
    }

    #[tokio::test]
    async fn sender_variants_share_one_correspondent() {
        let fx = fixture(&["a", "b", "c"]);
        let api = MockApi::default();
        let normalizer = Normalizer::default();
        let cfg = delivery_config();
        let deliverer = Deliverer::new(&api, &fx.store, &normalizer, &cfg);

        for (i, (id, sender)) in [
            ("a", "Aukro"),
            ("b", "aukro.cz"),
            ("c", "AUKRO s.r.o."),
        ]
        .iter()
        .enumerate()
        {
            let mut a = artifact(id, &format!("{i:032x}"), sender);
            // Force correspondent resolution through the sender field.
            a.fields.set_str("protistrana_nazev", sender.to_string());
            api.set_upload_checksum(&a.content_md5);
            deliverer
                .deliver_all(std::slice::from_ref(&a), &fx.lookup())
                .await
                .unwrap();
        }

        let state = api.state.lock().unwrap();
        assert_eq!(state.correspondents.len(), 1);
        assert_eq!(state.correspondents[0].name, "Aukro");
    }

    #[tokio::test]
    async fn tags_are_created_once() {
        let fx = fixture(&["a", "b"]);
        let api = MockApi::default();
        let normalizer = Normalizer::default();
        let cfg = delivery_config();
        let deliverer = Deliverer::new(&api, &fx.store, &normalizer, &cfg);

        for (i, id) in ["a", "b"].iter().enumerate() {
            let a = artifact(id, &format!("{i:032x}"), "x@y.cz");
            api.set_upload_checksum(&a.content_md5);
            deliverer
                .deliver_all(std::slice::from_ref(&a), &fx.lookup())
                .await
                .unwrap();
        }

        let state = api.state.lock().unwrap();
        // Kind tag + category tag, each exactly once.
        assert_eq!(state.tags.len(), 2);
        assert!(state.tags.contains_key("Faktura"));
        assert!(state.tags.contains_key("účetní"));
    }

    #[tokio::test]
    async fn missing_input_item_is_fatal_and_recorded() {
        let fx = fixture(&[]);
        let api = MockApi::default();
        let normalizer = Normalizer::default();
        let cfg = delivery_config();
        let deliverer = Deliverer::new(&api, &fx.store, &normalizer, &cfg);

        let a = artifact("ghost", &"9".repeat(32), "x@y.cz");
        let stats = deliverer
            .deliver_all(std::slice::from_ref(&a), &fx.lookup())
            .await
            .unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(fx.store.failure_count(5), 1);
        let records = fx.store.read_failures(5).unwrap();
        assert_eq!(records[0].reason, FailReason::DeliveryFatal);
    }

    #[test]
    fn field_values_coerce_to_delivery_types() {
        use serde_json::json;
        assert_eq!(
            convert_field("castka_celkem", &json!("1 234,50".replace(' ', ""))),
            Some(json!(1234.5))
        );
        assert_eq!(
            convert_field("datum_dokumentu", &json!("2024-12-15T10:00:00")),
            Some(json!("2024-12-15"))
        );
        assert_eq!(convert_field("datum_dokumentu", &json!("n/a")), None);
        assert_eq!(convert_field("ai_summary", &json!("")), None);
        assert_eq!(
            convert_field("polozky_json", &json!("[{\"a\":1}]")),
            Some(json!("[{\"a\":1}]"))
        );
    }
}
