//! Client for the external OCR/layout engine.
//!
//! The engine is a collaborator: it returns best-effort text or a typed
//! error and never hangs past its timeout. We enforce the timeout on our
//! side as well so a wedged engine cannot stall a worker holding a claim.

use std::time::Duration;

use derive_more::derive::Display;
use serde::Deserialize;

use crate::config::OcrConfig;

#[derive(Debug, Display)]
pub enum OcrError {
    #[display("ocr timeout")]
    Timeout,
    #[display("ocr engine error: {_0}")]
    Engine(String),
    #[display("ocr transport error: {_0}")]
    Transport(reqwest::Error),
}

impl std::error::Error for OcrError {}

#[derive(Debug, Clone, Deserialize)]
pub struct OcrText {
    pub text: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OcrResponse {
    Ok(OcrText),
    Err { error: String },
}

#[derive(Clone)]
pub struct OcrClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    max_pages: u32,
}

impl OcrClient {
    pub fn new(http: reqwest::Client, cfg: &OcrConfig) -> Self {
        OcrClient {
            http,
            endpoint: cfg.endpoint.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            max_pages: cfg.max_pages,
        }
    }

    /// Extract text from one attachment blob.
    pub async fn extract(
        &self,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<OcrText, OcrError> {
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(filename.to_string())
            .mime_str(content_type)
            .map_err(OcrError::Transport)?;
        let form = reqwest::multipart::Form::new()
            .part("document", part)
            .text("max_pages", self.max_pages.to_string());

        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OcrError::Timeout
                } else {
                    OcrError::Transport(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OcrError::Engine(format!("{status}: {body}")));
        }

        match response.json::<OcrResponse>().await {
            Ok(OcrResponse::Ok(text)) => Ok(text),
            Ok(OcrResponse::Err { error }) => Err(OcrError::Engine(error)),
            Err(e) => {
                if e.is_timeout() {
                    Err(OcrError::Timeout)
                } else {
                    Err(OcrError::Transport(e))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_shapes_decode() {
        let ok: OcrResponse =
            serde_json::from_str(r#"{"text":"Faktura","confidence":0.92,"language":"cs"}"#)
                .unwrap();
        assert!(matches!(ok, OcrResponse::Ok(t) if t.text == "Faktura"));

        let err: OcrResponse = serde_json::from_str(r#"{"error":"corrupt pdf"}"#).unwrap();
        assert!(matches!(err, OcrResponse::Err { error } if error == "corrupt pdf"));
    }
}
