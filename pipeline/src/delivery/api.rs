//! Document-management service API: the trait seam and its reqwest-backed
//! implementation.
//!
//! Every create path is preceded by a lookup and tolerates a duplicate
//! response, which is what makes delivery replayable.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use derive_more::derive::Display;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Display)]
pub enum DeliveryError {
    /// Duplicate on upload; treated as success by the caller.
    #[display("conflict")]
    Conflict,
    /// 5xx or transport problem; retried with backoff.
    #[display("transient: {_0}")]
    Transient(String),
    /// Terminal 4xx; fails the item.
    #[display("fatal: {_0}")]
    Fatal(String),
}

impl std::error::Error for DeliveryError {}

impl From<reqwest::Error> for DeliveryError {
    fn from(error: reqwest::Error) -> Self {
        DeliveryError::Transient(error.to_string())
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCorrespondent {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub document_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteNamed {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    results: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteDocumentRef {
    id: u64,
}

/// What the upload produced: a fresh document, or a duplicate already known
/// to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Created(u64),
    Duplicate,
}

/// The full HTTP surface the delivery phase and the merger need.
#[async_trait]
pub trait DocumentsApi: Send + Sync {
    async fn find_document_by_hash(&self, content_md5: &str) -> DeliveryResult<Option<u64>>;
    async fn upload_document(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        title: &str,
        correspondent: Option<u64>,
        document_type: Option<u64>,
        tags: &[u64],
    ) -> DeliveryResult<UploadOutcome>;
    async fn patch_custom_fields(
        &self,
        document_id: u64,
        fields: &[(u64, Value)],
    ) -> DeliveryResult<()>;

    async fn find_correspondent(&self, name: &str) -> DeliveryResult<Option<RemoteCorrespondent>>;
    async fn create_correspondent(&self, name: &str) -> DeliveryResult<RemoteCorrespondent>;
    async fn list_correspondents(&self) -> DeliveryResult<Vec<RemoteCorrespondent>>;
    async fn delete_correspondent(&self, id: u64) -> DeliveryResult<()>;
    async fn documents_for_correspondent(&self, id: u64) -> DeliveryResult<Vec<u64>>;
    async fn reassign_document(&self, document_id: u64, correspondent: u64) -> DeliveryResult<()>;
    async fn rename_correspondent(&self, id: u64, name: &str) -> DeliveryResult<()>;

    async fn get_or_create_tag(&self, name: &str) -> DeliveryResult<u64>;
    async fn get_or_create_document_type(&self, name: &str) -> DeliveryResult<u64>;
    async fn get_or_create_custom_field(&self, name: &str, data_type: &str) -> DeliveryResult<u64>;
}

/// reqwest client with token auth and in-process caches for tags, document
/// types and custom fields, mirroring how often those lookups repeat.
pub struct HttpDocumentsApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
    tag_cache: Mutex<HashMap<String, u64>>,
    doc_type_cache: Mutex<HashMap<String, u64>>,
    field_cache: Mutex<HashMap<String, u64>>,
}

impl HttpDocumentsApi {
    pub fn new(http: reqwest::Client, base_url: &str, token: &str) -> Self {
        HttpDocumentsApi {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            tag_cache: Mutex::new(HashMap::new()),
            doc_type_cache: Mutex::new(HashMap::new()),
            field_cache: Mutex::new(HashMap::new()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("Authorization", format!("Token {}", self.token))
    }

    async fn check(response: reqwest::Response) -> DeliveryResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::CONFLICT => Err(DeliveryError::Conflict),
            s if s.is_server_error() => Err(DeliveryError::Transient(format!("{s}: {body}"))),
            s => Err(DeliveryError::Fatal(format!("{s}: {body}"))),
        }
    }

    async fn find_named(&self, path: &str, name: &str) -> DeliveryResult<Option<RemoteNamed>> {
        let response = self
            .auth(self.http.get(self.url(path)))
            .query(&[("name__iexact", name)])
            .send()
            .await?;
        let page: Page<RemoteNamed> = Self::check(response).await?.json().await?;
        Ok(page
            .results
            .into_iter()
            .find(|r| r.name.eq_ignore_ascii_case(name)))
    }

    async fn create_named(&self, path: &str, body: Value) -> DeliveryResult<RemoteNamed> {
        let response = self
            .auth(self.http.post(self.url(path)))
            .json(&body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn get_or_create_named(
        &self,
        path: &str,
        name: &str,
        cache: &Mutex<HashMap<String, u64>>,
        body: Value,
    ) -> DeliveryResult<u64> {
        if let Some(id) = cache.lock().unwrap().get(name) {
            return Ok(*id);
        }
        let id = match self.find_named(path, name).await? {
            Some(existing) => existing.id,
            None => match self.create_named(path, body).await {
                Ok(created) => created.id,
                Err(DeliveryError::Conflict) => {
                    // Another worker created it between our lookup and the
                    // create; re-read.
                    self.find_named(path, name)
                        .await?
                        .map(|r| r.id)
                        .ok_or_else(|| {
                            DeliveryError::Transient(format!("conflict without row for {name}"))
                        })?
                }
                Err(e) => return Err(e),
            },
        };
        cache.lock().unwrap().insert(name.to_string(), id);
        Ok(id)
    }
}

#[async_trait]
impl DocumentsApi for HttpDocumentsApi {
    async fn find_document_by_hash(&self, content_md5: &str) -> DeliveryResult<Option<u64>> {
        let response = self
            .auth(self.http.get(self.url("/api/documents/")))
            .query(&[("checksum__iexact", content_md5), ("page_size", "1")])
            .send()
            .await?;
        let page: Page<RemoteDocumentRef> = Self::check(response).await?.json().await?;
        Ok(page.results.first().map(|d| d.id))
    }

    async fn upload_document(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        title: &str,
        correspondent: Option<u64>,
        document_type: Option<u64>,
        tags: &[u64],
    ) -> DeliveryResult<UploadOutcome> {
        let mut form = reqwest::multipart::Form::new()
            .part(
                "document",
                reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string()),
            )
            .text("title", title.to_string());
        if let Some(id) = correspondent {
            form = form.text("correspondent", id.to_string());
        }
        if let Some(id) = document_type {
            form = form.text("document_type", id.to_string());
        }
        for tag in tags {
            form = form.text("tags", tag.to_string());
        }

        let response = self
            .auth(self.http.post(self.url("/api/documents/post_document/")))
            .multipart(form)
            .send()
            .await?;
        match Self::check(response).await {
            Ok(response) => {
                let value: Value = response.json().await.unwrap_or(Value::Null);
                let id = value
                    .get("id")
                    .or_else(|| value.get("document_id"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                Ok(UploadOutcome::Created(id))
            }
            Err(DeliveryError::Conflict) => Ok(UploadOutcome::Duplicate),
            Err(e) => Err(e),
        }
    }

    async fn patch_custom_fields(
        &self,
        document_id: u64,
        fields: &[(u64, Value)],
    ) -> DeliveryResult<()> {
        let payload: Vec<Value> = fields
            .iter()
            .map(|(field, value)| json!({ "field": field, "value": value }))
            .collect();
        let response = self
            .auth(
                self.http
                    .patch(self.url(&format!("/api/documents/{document_id}/"))),
            )
            .json(&json!({ "custom_fields": payload }))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn find_correspondent(&self, name: &str) -> DeliveryResult<Option<RemoteCorrespondent>> {
        let response = self
            .auth(self.http.get(self.url("/api/correspondents/")))
            .query(&[("name__iexact", name)])
            .send()
            .await?;
        let page: Page<RemoteCorrespondent> = Self::check(response).await?.json().await?;
        Ok(page
            .results
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(name)))
    }

    async fn create_correspondent(&self, name: &str) -> DeliveryResult<RemoteCorrespondent> {
        let response = self
            .auth(self.http.post(self.url("/api/correspondents/")))
            .json(&json!({ "name": name }))
            .send()
            .await?;
        match Self::check(response).await {
            Ok(response) => Ok(response.json().await?),
            Err(DeliveryError::Conflict) => self
                .find_correspondent(name)
                .await?
                .ok_or_else(|| DeliveryError::Transient(format!("conflict without row for {name}"))),
            Err(e) => Err(e),
        }
    }

    async fn list_correspondents(&self) -> DeliveryResult<Vec<RemoteCorrespondent>> {
        let mut all = Vec::new();
        let mut page_num = 1;
        loop {
            let response = self
                .auth(self.http.get(self.url("/api/correspondents/")))
                .query(&[("page", page_num.to_string().as_str()), ("page_size", "100")])
                .send()
                .await?;
            let page: Page<RemoteCorrespondent> = Self::check(response).await?.json().await?;
            all.extend(page.results);
            if page.next.is_none() {
                return Ok(all);
            }
            page_num += 1;
        }
    }

    async fn delete_correspondent(&self, id: u64) -> DeliveryResult<()> {
        let response = self
            .auth(
                self.http
                    .delete(self.url(&format!("/api/correspondents/{id}/"))),
            )
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn documents_for_correspondent(&self, id: u64) -> DeliveryResult<Vec<u64>> {
        let mut ids = Vec::new();
        let mut page_num = 1;
        loop {
            let response = self
                .auth(self.http.get(self.url("/api/documents/")))
                .query(&[
                    ("correspondent__id", id.to_string().as_str()),
                    ("page", page_num.to_string().as_str()),
                    ("page_size", "100"),
                ])
                .send()
                .await?;
            let page: Page<RemoteDocumentRef> = Self::check(response).await?.json().await?;
            ids.extend(page.results.iter().map(|d| d.id));
            if page.next.is_none() {
                return Ok(ids);
            }
            page_num += 1;
        }
    }

    async fn reassign_document(&self, document_id: u64, correspondent: u64) -> DeliveryResult<()> {
        let response = self
            .auth(
                self.http
                    .patch(self.url(&format!("/api/documents/{document_id}/"))),
            )
            .json(&json!({ "correspondent": correspondent }))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn rename_correspondent(&self, id: u64, name: &str) -> DeliveryResult<()> {
        let response = self
            .auth(
                self.http
                    .patch(self.url(&format!("/api/correspondents/{id}/"))),
            )
            .json(&json!({ "name": name }))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn get_or_create_tag(&self, name: &str) -> DeliveryResult<u64> {
        self.get_or_create_named("/api/tags/", name, &self.tag_cache, json!({ "name": name }))
            .await
    }

    async fn get_or_create_document_type(&self, name: &str) -> DeliveryResult<u64> {
        self.get_or_create_named(
            "/api/document_types/",
            name,
            &self.doc_type_cache,
            json!({ "name": name }),
        )
        .await
    }

    async fn get_or_create_custom_field(&self, name: &str, data_type: &str) -> DeliveryResult<u64> {
        self.get_or_create_named(
            "/api/custom_fields/",
            name,
            &self.field_cache,
            json!({ "name": name, "data_type": data_type }),
        )
        .await
    }
}
