//! Correspondent name normalization.
//!
//! Raw senders collapse to a normalized key; two senders are the same
//! correspondent iff their keys match. The pipeline is deterministic and
//! order-sensitive: display-part extraction, symbol stripping, lowercasing,
//! legal-form and service-token removal, domain-suffix removal, whitespace
//! collapse, trailing issue numbers dropped.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

static LEGAL_SUFFIXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\s+inc\.?$",
        r"(?i)\s+ltd\.?$",
        r"(?i)\s+gmbh$",
        r"(?i)\s+s\.?r\.?o\.?$",
        r"(?i)\s+a\.?s\.?$",
        r"(?i)\s+corp\.?$",
        r"(?i)\s+llc$",
        r"(?i)\s+ag$",
        r"(?i)\s+co\.?$",
        r"(?i)\s+sp\.\s*z\.?\s*o\.?\s*o\.?$",
        r"(?i)\s+b\.?v\.?$",
        r"(?i)\s+n\.?v\.?$",
        r"(?i)\s+plc$",
        r"(?i)\s+pty\.?\s*ltd\.?$",
        r"(?i)\s+limited$",
        r"(?i)\s+holding$",
        r"(?i),\s*s\.?r\.?o\.?$",
        r"(?i),\s*a\.?s\.?$",
        r"(?i),\s*spol\.\s*s\s*r\.?o\.?$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static SERVICE_SUFFIXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\s+newsletter$",
        r"(?i)\s+news$",
        r"(?i)\s+price\s+alerts?$",
        r"(?i)\s+alerts?$",
        r"(?i)\s+deals?$",
        r"(?i)\s+home$",
        r"(?i)\s+info$",
        r"(?i)\s+team$",
        r"(?i)\s+support$",
        r"(?i)\s+noreply$",
        r"(?i)\s+no-reply$",
        r"(?i)\s+mailer$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static RE_DOMAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(cz|com|de|net|org|eu|sk|io|co|uk|at|ch)$").unwrap());
static RE_DISPLAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+?)\s*<[^>]+>$").unwrap());
static RE_NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s-]").unwrap());
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static RE_TRAILING_NUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+\d+$").unwrap());
static RE_ISSUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(č|no|nr|issue|vol)\.?\s*\d+.*$").unwrap());

/// Manual overrides for the display name of well-known correspondents.
static KNOWN_MAPPINGS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("adobe", "Adobe"),
        ("adobe systems", "Adobe"),
        ("google", "Google"),
        ("google alerts", "Google"),
        ("alza", "Alza.cz"),
        ("alza cz", "Alza.cz"),
        ("booking", "Booking.com"),
        ("booking com", "Booking.com"),
        ("tripadvisor", "Tripadvisor"),
        ("kickstarter", "Kickstarter"),
        ("hobynaradi", "HobyNaradi.cz"),
        ("hobynaradi cz", "HobyNaradi.cz"),
        ("datart", "DATART"),
        ("mall", "MALL.CZ"),
        ("mall cz", "MALL.CZ"),
        ("slevomat", "Slevomat.cz"),
        ("slevomat cz", "Slevomat.cz"),
        ("aukro", "Aukro"),
        ("tesla lighting", "TESLA LIGHTING"),
        ("loxone", "Loxone"),
        ("ubiquiti", "Ubiquiti"),
        ("agoda", "Agoda"),
        ("expondo", "Expondo.cz"),
        ("expondo cz", "Expondo.cz"),
    ])
});

/// Resolves senders to normalized keys and display names, with optional
/// extra mappings from configuration layered over the built-in table.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    extra_mappings: HashMap<String, String>,
}

impl Normalizer {
    pub fn new(extra_mappings: HashMap<String, String>) -> Self {
        Normalizer { extra_mappings }
    }

    /// The normalized key; deduplication identity of a sender.
    pub fn normalize(&self, name: &str) -> String {
        normalize_key(name)
    }

    /// Human-facing display name for a raw sender.
    pub fn best_display_name(&self, name: &str) -> String {
        let key = normalize_key(name);
        if let Some(mapped) = self.extra_mappings.get(&key) {
            return mapped.clone();
        }
        if let Some(mapped) = KNOWN_MAPPINGS.get(key.as_str()) {
            return (*mapped).to_string();
        }

        // No override: clean the original for display.
        let mut cleaned = strip_symbols(display_part(name));
        cleaned = RE_WS.replace_all(cleaned.trim(), " ").to_string();
        for re in LEGAL_SUFFIXES.iter() {
            cleaned = re.replace(&cleaned, "").to_string();
        }
        let cleaned = cleaned.trim().to_string();
        if !cleaned.is_empty() {
            return cleaned;
        }
        if !key.is_empty() {
            return title_case(&key);
        }
        name.to_string()
    }
}

fn normalize_key(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }

    let name = display_part(name);
    let name = strip_symbols(name);
    let mut name = name.to_lowercase().trim().to_string();

    for re in LEGAL_SUFFIXES.iter() {
        name = re.replace(&name, "").to_string();
    }
    for re in SERVICE_SUFFIXES.iter() {
        name = re.replace(&name, "").to_string();
    }
    name = RE_DOMAIN.replace(&name, "").to_string();
    name = RE_ISSUE.replace(&name, "").to_string();
    name = RE_NON_WORD.replace_all(&name, " ").to_string();
    name = RE_WS.replace_all(&name, " ").trim().to_string();
    name = RE_TRAILING_NUM.replace(&name, "").to_string();

    name.trim().to_string()
}

/// `"Display <addr@host>"` -> `"Display"`; otherwise unchanged.
fn display_part(name: &str) -> &str {
    match RE_DISPLAY.captures(name) {
        Some(caps) => name[..caps.get(1).unwrap().end()].trim(),
        None => name,
    }
}

/// Drop emoji and decoration, keeping letters, digits, whitespace and the
/// punctuation that carries meaning in company names.
fn strip_symbols(name: &str) -> String {
    name.chars()
        .filter(|c| {
            c.is_alphanumeric()
                || c.is_whitespace()
                || matches!(c, '.' | ',' | '-' | '&' | '+' | '\'' | '/' | '@' | '*' | '(' | ')')
        })
        .collect()
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
