//! Prompting and verdict parsing for the local and external model endpoints.
//!
//! Both speak the chat-completions shape. The extraction prompt asks for the
//! 31-field JSON object; parsing tries strict JSON first and falls back to a
//! regex salvage of `doc_typ` when a model wraps its answer in prose.

use std::time::Duration;

use async_trait::async_trait;
use derive_more::derive::Display;
use indoc::formatdoc;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use lib_field_extract::{EmailMeta, FieldSet};

use crate::classify::DocumentKind;

#[derive(Debug, Display)]
pub enum ModelError {
    #[display("model timeout")]
    Timeout,
    #[display("model response unparseable: {_0}")]
    Unparseable(String),
    #[display("rate limited")]
    RateLimited,
    #[display("model api error: {_0}")]
    Api(String),
    #[display("model transport error: {_0}")]
    Transport(reqwest::Error),
}

impl std::error::Error for ModelError {}

/// Structured verdict of one model call.
#[derive(Debug, Clone)]
pub struct ModelVerdict {
    pub doc_kind: DocumentKind,
    pub fields: FieldSet,
    pub confidence: f32,
}

/// Verdict plus accounting data the budget needs.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub verdict: ModelVerdict,
    pub total_tokens: u64,
}

/// Seam between the escalation logic and the HTTP endpoints, so phase logic
/// is testable against scripted backends.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn classify(
        &self,
        model: &str,
        timeout: Duration,
        meta: &EmailMeta,
        text: &str,
    ) -> Result<ModelReply, ModelError>;
}

pub fn extraction_prompt(meta: &EmailMeta, text: &str) -> String {
    let body: String = text.chars().take(3000).collect();
    formatdoc! {r#"
        Analyzuj tento email a extrahuj strukturované informace.

        EMAIL:
        Od: {from}
        Komu: {to}
        Předmět: {subject}
        Datum: {date}

        OBSAH:
        {body}

        Odpověz POUZE validním JSON (bez markdown) s těmito poli:
        {{
          "doc_typ": "invoice|receipt|tax_document|bank_statement|order|contract|parking_ticket|car_service|car_wash|glass_work|proforma|delivery_note|payment_document|system_notification|marketing|correspondence|it_notes|project_notes|unknown",
          "protistrana_nazev": "název firmy/odesílatele",
          "protistrana_ico": "IČO pokud je uvedeno",
          "protistrana_typ": "firma|osvc|fo",
          "castka_celkem": 0.0,
          "datum_dokumentu": "YYYY-MM-DD",
          "cislo_dokumentu": "číslo dokumentu",
          "mena": "CZK|EUR|USD",
          "stav_platby": "zaplaceno|nezaplaceno|castecne|neznamy",
          "datum_splatnosti": "YYYY-MM-DD",
          "kategorie": "kategorie dokumentu",
          "od_osoba": "jméno odesílatele",
          "od_osoba_role": "role/pozice",
          "od_firma": "firma odesílatele",
          "pro_osoba": "jméno příjemce",
          "pro_osoba_role": "role příjemce",
          "pro_firma": "firma příjemce",
          "predmet": "stručný popis o čem dokument je",
          "ai_summary": "souhrn max 100 slov",
          "ai_keywords": "klíčová slova oddělená čárkou",
          "ai_popis": "podrobnější popis obsahu",
          "typ_sluzby": "typ služby pokud je",
          "nazev_sluzby": "název služby",
          "predmet_typ": "typ předmětu",
          "predmet_nazev": "název předmětu",
          "polozky_text": "položky jako text",
          "perioda": "období dokumentu",
          "confidence": 0.0
        }}
        Všechna pole musí být přítomna (použij null pokud nelze určit)."#,
        from = meta.from,
        to = meta.to,
        subject = meta.subject,
        date = meta.date,
    }
}

/// Decode a model's text answer into a verdict. Strict JSON first, then the
/// regex salvage for `doc_typ`.
pub fn parse_verdict(content: &str) -> Result<ModelVerdict, ModelError> {
    static RE_DOC_TYP: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#""doc_typ"\s*:\s*"([a-z_]+)""#).unwrap());
    static RE_CONFIDENCE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#""confidence"\s*:\s*([0-9.]+)"#).unwrap());
    static RE_JSON_BLOCK: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

    let value: serde_json::Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(_) => {
            // Models occasionally wrap the object in prose or a code fence.
            let block = RE_JSON_BLOCK
                .find(content)
                .and_then(|b| serde_json::from_str(b.as_str()).ok());
            match block {
                Some(v) => v,
                None => {
                    let kind = RE_DOC_TYP
                        .captures(content)
                        .and_then(|c| c[1].parse::<DocumentKind>().ok())
                        .ok_or_else(|| ModelError::Unparseable(snippet(content)))?;
                    let confidence = RE_CONFIDENCE
                        .captures(content)
                        .and_then(|c| c[1].parse::<f32>().ok())
                        .unwrap_or(0.5);
                    return Ok(ModelVerdict {
                        doc_kind: kind,
                        fields: FieldSet::default(),
                        confidence,
                    });
                }
            }
        }
    };

    let doc_kind = value
        .get("doc_typ")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<DocumentKind>().ok())
        .ok_or_else(|| ModelError::Unparseable(snippet(content)))?;
    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_f64())
        .map(|c| c as f32)
        .unwrap_or(0.7);

    Ok(ModelVerdict {
        doc_kind,
        fields: FieldSet::from_value(&value),
        confidence,
    })
}

fn snippet(content: &str) -> String {
    content.chars().take(200).collect()
}

// Chat-completions wire shapes.

#[derive(Debug, Serialize, Deserialize)]
pub struct PromptUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiResponse {
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<PromptUsage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiError {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatApiResponseOrError {
    Response(ChatApiResponse),
    Error { error: ChatApiError },
}

/// reqwest-backed chat-completions client used for both the local inference
/// servers and the external large-model endpoint.
#[derive(Clone)]
pub struct ChatCompletionsBackend {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    temperature: f64,
}

impl ChatCompletionsBackend {
    pub fn new(http: reqwest::Client, endpoint: String, api_key: Option<String>) -> Self {
        ChatCompletionsBackend {
            http,
            endpoint,
            api_key,
            temperature: 0.1,
        }
    }

    async fn call_once(
        &self,
        model: &str,
        timeout: Duration,
        prompt: &str,
    ) -> Result<ModelReply, ModelError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&json!({
                "model": model,
                "temperature": self.temperature,
                "messages": [
                    {
                        "role": "system",
                        "content": "Jsi expert na analýzu a klasifikaci dokumentů. Odpovídáš pouze validním JSON."
                    },
                    { "role": "user", "content": prompt }
                ],
                "response_format": { "type": "json_object" }
            }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout
            } else {
                ModelError::Transport(e)
            }
        })?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelError::RateLimited);
        }

        let value: serde_json::Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout
            } else {
                ModelError::Transport(e)
            }
        })?;
        let parsed: ChatApiResponseOrError = serde_json::from_value(value.clone())
            .map_err(|_| ModelError::Unparseable(snippet(&value.to_string())))?;

        let parsed = match parsed {
            ChatApiResponseOrError::Error { error } => {
                if error.message.to_lowercase().contains("rate limit") {
                    return Err(ModelError::RateLimited);
                }
                return Err(ModelError::Api(error.message));
            }
            ChatApiResponseOrError::Response(r) => r,
        };

        let choice = parsed
            .choices
            .first()
            .ok_or_else(|| ModelError::Api("no choices in response".to_string()))?;
        let verdict = parse_verdict(&choice.message.content)?;
        Ok(ModelReply {
            verdict,
            total_tokens: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }
}

#[async_trait]
impl InferenceBackend for ChatCompletionsBackend {
    async fn classify(
        &self,
        model: &str,
        timeout: Duration,
        meta: &EmailMeta,
        text: &str,
    ) -> Result<ModelReply, ModelError> {
        let prompt = extraction_prompt(meta, text);
        match self.call_once(model, timeout, &prompt).await {
            Err(ModelError::Unparseable(_)) => {
                // One retry on garbled output before giving up.
                self.call_once(model, timeout, &prompt).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_verdict_parses() {
        let content = r#"{"doc_typ": "invoice", "castka_celkem": 1200.0,
            "mena": "CZK", "confidence": 0.9}"#;
        let verdict = parse_verdict(content).unwrap();
        assert_eq!(verdict.doc_kind, DocumentKind::Invoice);
        assert_eq!(verdict.fields.get_f64("castka_celkem"), Some(1200.0));
        assert!((verdict.confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn json_inside_prose_parses() {
        let content = "Here is the result:\n```json\n{\"doc_typ\": \"receipt\", \"confidence\": 0.8}\n```";
        let verdict = parse_verdict(content).unwrap();
        assert_eq!(verdict.doc_kind, DocumentKind::Receipt);
    }

    #[test]
    fn regex_salvage_recovers_doc_typ() {
        let content = r#"The document is "doc_typ": "order" and "confidence": 0.66 I think"#;
        let verdict = parse_verdict(content).unwrap();
        assert_eq!(verdict.doc_kind, DocumentKind::Order);
        assert!((verdict.confidence - 0.66).abs() < f32::EPSILON);
        assert_eq!(verdict.fields.populated(), 0);
    }

    #[test]
    fn nonsense_is_unparseable() {
        let err = parse_verdict("I have no idea").unwrap_err();
        assert!(matches!(err, ModelError::Unparseable(_)));
    }

    #[test]
    fn unknown_kind_string_is_unparseable() {
        let err = parse_verdict(r#"{"doc_typ": "sonnet"}"#).unwrap_err();
        assert!(matches!(err, ModelError::Unparseable(_)));
    }

    #[test]
    fn prompt_carries_envelope_and_body() {
        let meta = EmailMeta {
            from: "a@b.cz".to_string(),
            to: "c@d.cz".to_string(),
            subject: "Faktura".to_string(),
            date: "2024-12-15".to_string(),
        };
        let prompt = extraction_prompt(&meta, "Celkem 1200 Kč");
        assert!(prompt.contains("Od: a@b.cz"));
        assert!(prompt.contains("Celkem 1200 Kč"));
        assert!(prompt.contains("\"doc_typ\""));
    }

    #[test]
    fn api_error_shape_decodes() {
        let raw = r#"{"error": {"message": "Requests rate limit exceeded"}}"#;
        let parsed: ChatApiResponseOrError = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, ChatApiResponseOrError::Error { .. }));
    }
}
