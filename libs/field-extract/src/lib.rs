//! Regex-driven extraction of the 31 custom fields shared by every phase of
//! the pipeline and by the delivery step.
//!
//! The extractor is a pure function over document text plus email metadata.
//! It never touches the network or the filesystem; model-based phases reuse
//! the same field names so their output is interchangeable with this one.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Canonical field order. Delivery relies on these exact names.
pub const FIELD_NAMES: [&str; 31] = [
    "doc_typ",
    "protistrana_nazev",
    "protistrana_ico",
    "protistrana_typ",
    "castka_celkem",
    "datum_dokumentu",
    "cislo_dokumentu",
    "mena",
    "stav_platby",
    "datum_splatnosti",
    "kategorie",
    "email_from",
    "email_to",
    "email_subject",
    "od_osoba",
    "od_osoba_role",
    "od_firma",
    "pro_osoba",
    "pro_osoba_role",
    "pro_firma",
    "predmet",
    "ai_summary",
    "ai_keywords",
    "ai_popis",
    "typ_sluzby",
    "nazev_sluzby",
    "predmet_typ",
    "predmet_nazev",
    "polozky_text",
    "polozky_json",
    "perioda",
];

/// Data type of a field on the document-management side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Float,
    Date,
}

pub fn field_type(name: &str) -> FieldType {
    match name {
        "castka_celkem" => FieldType::Float,
        "datum_dokumentu" | "datum_splatnosti" => FieldType::Date,
        _ => FieldType::String,
    }
}

/// Email envelope metadata fed into extraction alongside the text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailMeta {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: String,
}

/// Ordered map of the 31 fields. Absent values are `null` so every record
/// carries the full field set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct FieldSet(pub IndexMap<String, Value>);

impl Default for FieldSet {
    fn default() -> Self {
        let mut map = IndexMap::with_capacity(FIELD_NAMES.len());
        for name in FIELD_NAMES {
            map.insert(name.to_string(), Value::Null);
        }
        FieldSet(map)
    }
}

impl FieldSet {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.replace(',', ".").parse().ok(),
            _ => None,
        })
    }

    pub fn set(&mut self, name: &str, value: Value) {
        if FIELD_NAMES.contains(&name) {
            self.0.insert(name.to_string(), value);
        }
    }

    pub fn set_str(&mut self, name: &str, value: impl Into<String>) {
        self.set(name, Value::String(value.into()));
    }

    /// Build a field set from arbitrary JSON, keeping only known field names.
    /// Used to sanitize model output.
    pub fn from_value(value: &Value) -> Self {
        let mut fields = FieldSet::default();
        if let Some(map) = value.as_object() {
            for name in FIELD_NAMES {
                if let Some(v) = map.get(name) {
                    if !v.is_null() {
                        fields.0.insert(name.to_string(), v.clone());
                    }
                }
            }
        }
        fields
    }

    /// Count of non-null fields.
    pub fn populated(&self) -> usize {
        self.0.values().filter(|v| !v.is_null()).count()
    }
}

/// Document category per kind, used for the `kategorie` field.
fn category_for(doc_kind: &str) -> &'static str {
    match doc_kind {
        "invoice" | "receipt" | "bank_statement" | "proforma" | "payment_document" => "účetní",
        "tax_document" => "daňové",
        "contract" => "právní",
        "order" => "obchodní",
        "delivery_note" => "logistika",
        "parking_ticket" | "car_service" | "car_wash" | "glass_work" => "auto",
        "marketing" => "marketing",
        "correspondence" | "system_notification" => "korespondence",
        "it_notes" | "project_notes" => "poznámky",
        _ => "ostatní",
    }
}

const SERVICE_TYPES: &[(&str, &[&str])] = &[
    ("hosting", &["hosting", "server", "cloud", "aws", "azure"]),
    ("telekomunikace", &["telefon", "mobile", "tarif", "internet", "wifi"]),
    ("software", &["licence", "software", "subscription", "saas"]),
    ("energie", &["elektřina", "plyn", "energie", "eon", "čez", "innogy"]),
    ("pojištění", &["pojištění", "insurance", "pojistka"]),
    ("účetnictví", &["účetní", "daňov", "audit"]),
    ("právní", &["advokát", "právní", "notář"]),
    ("doprava", &["doprava", "přeprava", "kurýr", "pošta"]),
    ("marketing", &["reklama", "marketing", "google ads", "facebook"]),
];

static RE_ICO: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)IČO?[:\s]*(\d{8})").unwrap());
static RE_DIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)DIČ[:\s]*(CZ\d{8,10})").unwrap());
static RE_VS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:VS|var(?:iabilní)?\s*symbol)[:\s]*(\d{4,10})").unwrap());

static RE_AMOUNTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)celkem\s*(?:k\s*úhradě)?[:\s]*([0-9][0-9\s,.]*)\s*(?:Kč|CZK|EUR|€|\$|USD)?",
        r"(?i)total\s*(?:amount)?[:\s]*([0-9][0-9\s,.]*)\s*(?:Kč|CZK|EUR|€|\$|USD)?",
        r"(?i)k\s*úhradě[:\s]*([0-9][0-9\s,.]*)\s*(?:Kč|CZK|EUR|€|\$|USD)?",
        r"(?i)částka[:\s]*([0-9][0-9\s,.]*)\s*(?:Kč|CZK|EUR|€|\$|USD)?",
        r"(?i)suma[:\s]*([0-9][0-9\s,.]*)\s*(?:Kč|CZK|EUR|€|\$|USD)?",
        r"(?i)cena[:\s]*([0-9][0-9\s,.]*)\s*(?:Kč|CZK|EUR|€|\$|USD)?",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static RE_DATE_YMD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})").unwrap());
static RE_DATE_DMY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2})[./](\d{1,2})[./](\d{4})").unwrap());
static RE_DUE_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:splatnost\w*|due\s*date|fällig)[:\s]*(\d{1,2})[./](\d{1,2})[./](\d{4})")
        .unwrap()
});

// The capture requires a digit; document references are never bare words.
static RE_DOC_NUMBERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(?:faktura|invoice|doklad)\s*(?:č|číslo|nr?|number)?[.:\s#]*([A-Z0-9/-]*\d[A-Z0-9/-]*)",
        r"(?i)(?:číslo\s*(?:faktury|dokladu))[:\s]*([A-Z0-9/-]*\d[A-Z0-9/-]*)",
        r"(?i)(?:rechnung)\s*(?:no|nr)?[.:\s#]*([A-Z0-9/-]*\d[A-Z0-9/-]*)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static RE_SUPPLIER: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(?:dodavatel|supplier|verkäufer)[:\s]*([^\n]{3,60})",
        r"(?i)(?:vystavil|issued\s*by)[:\s]*([^\n]{3,60})",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static RE_CUSTOMER: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(?:odběratel|customer|käufer)[:\s]*([^\n]{3,60})",
        r"(?i)(?:příjemce|recipient)[:\s]*([^\n]{3,60})",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static RE_NAME_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*(IČO?|DIČ|s\.r\.o\.|a\.s\.|spol\..*|, .*$)").unwrap());

static RE_PERIOD_MONTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:období|period|za\s*měsíc)[:\s]*(\d{1,2})[./](\d{4})").unwrap());
static RE_PERIOD_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:období|period)[:\s]*(\d{4})").unwrap());
static RE_PERIOD_BARE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,2})/(\d{4})").unwrap());

static RE_ITEMS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\d+[.)]\s*(.+?)\s+(\d+)\s*[xX×]?\s*([0-9,.]+)").unwrap());

static RE_SUBJECT_LINE: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(?:předmět|věc)[:\s]*([^\n]{10,100})",
        r"(?i)(?:betreff)[:\s]*([^\n]{10,100})",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Extract all 31 fields from document text.
///
/// `doc_kind` is the already-assigned classification (snake_case); it lands
/// in `doc_typ` and drives `kategorie` and `predmet_typ`.
pub fn extract_all(text: &str, meta: &EmailMeta, doc_kind: &str) -> FieldSet {
    let mut fields = FieldSet::default();

    fields.set_str("doc_typ", doc_kind);
    fields.set_str("kategorie", category_for(doc_kind));
    fields.set_str("email_from", meta.from.clone());
    fields.set_str("email_to", meta.to.clone());
    fields.set_str("email_subject", meta.subject.clone());
    if !meta.subject.is_empty() {
        fields.set_str("predmet", truncate(&meta.subject, 200));
    }

    if text.is_empty() {
        return fields;
    }
    let lower = text.to_lowercase();

    extract_counterparty(text, &lower, &mut fields);

    if let Some(amount) = extract_amount(text) {
        fields.set("castka_celkem", json!(amount));
    }
    if let Some(date) = extract_date(text) {
        fields.set_str("datum_dokumentu", date);
    }
    if let Some(num) = extract_doc_number(text) {
        fields.set_str("cislo_dokumentu", num);
    } else if let Some(vs) = RE_VS.captures(text) {
        // Variable symbol is the usable document reference when no explicit
        // number is printed.
        fields.set_str("cislo_dokumentu", vs[1].to_string());
    }
    if let Some(c) = extract_currency(text, &lower) {
        fields.set_str("mena", c);
    }
    if let Some(s) = extract_payment_status(&lower) {
        fields.set_str("stav_platby", s);
    }
    if let Some(due) = RE_DUE_DATE.captures(text) {
        fields.set_str(
            "datum_splatnosti",
            format!("{}-{:0>2}-{:0>2}", &due[3], &due[2], &due[1]),
        );
    }

    extract_persons(text, meta, &mut fields);

    if let Some(kw) = extract_keywords(&lower) {
        fields.set_str("ai_keywords", kw);
    }
    if let Some(summary) = extract_summary(text) {
        fields.set_str("ai_summary", summary);
    }
    extract_service(&lower, &mut fields);
    extract_subject_type(text, doc_kind, &mut fields);
    extract_items(text, &mut fields);
    if let Some(p) = extract_period(text) {
        fields.set_str("perioda", p);
    }

    fields
}

fn extract_counterparty(text: &str, lower: &str, fields: &mut FieldSet) {
    if let Some(caps) = RE_ICO.captures(text) {
        fields.set_str("protistrana_ico", caps[1].to_string());
    } else if let Some(caps) = RE_DIC.captures(text) {
        // DIČ carries the IČO inside the CZ prefix for most entities.
        let dic = &caps[1];
        if dic.len() >= 10 {
            fields.set_str("protistrana_ico", dic[2..10].to_string());
        }
    }

    for re in RE_SUPPLIER.iter() {
        if let Some(caps) = re.captures(text) {
            let name = RE_NAME_SUFFIX.replace(caps[1].trim(), "").trim().to_string();
            if !name.is_empty() {
                fields.set_str("protistrana_nazev", truncate(&name, 100));
            }
            break;
        }
    }

    if fields.get("protistrana_ico").is_some() {
        let typ = if lower.contains("osvč") || lower.contains("živnost") {
            "OSVČ"
        } else {
            "firma"
        };
        fields.set_str("protistrana_typ", typ);
    }
}

fn extract_amount(text: &str) -> Option<f64> {
    for re in RE_AMOUNTS.iter() {
        if let Some(caps) = re.captures(text) {
            let mut s = caps[1].replace(' ', "").replace(',', ".");
            // Collapse thousands separators: keep only the last dot.
            if s.matches('.').count() > 1 {
                if let Some(pos) = s.rfind('.') {
                    let (head, tail) = s.split_at(pos);
                    s = format!("{}{}", head.replace('.', ""), tail);
                }
            }
            let s = s.trim_end_matches('.');
            if let Ok(v) = s.parse::<f64>() {
                return Some(v);
            }
        }
    }
    None
}

fn extract_date(text: &str) -> Option<String> {
    if let Some(caps) = RE_DATE_YMD.captures(text) {
        return Some(format!("{}-{}-{}", &caps[1], &caps[2], &caps[3]));
    }
    RE_DATE_DMY
        .captures(text)
        .map(|caps| format!("{}-{:0>2}-{:0>2}", &caps[3], &caps[2], &caps[1]))
}

fn extract_doc_number(text: &str) -> Option<String> {
    for re in RE_DOC_NUMBERS.iter() {
        if let Some(caps) = re.captures(text) {
            let num = caps[1].trim();
            if (3..=30).contains(&num.len()) {
                return Some(num.to_string());
            }
        }
    }
    None
}

fn extract_currency(text: &str, lower: &str) -> Option<&'static str> {
    if lower.contains("czk") || lower.contains("kč") {
        Some("CZK")
    } else if lower.contains("eur") || text.contains('€') {
        Some("EUR")
    } else if lower.contains("usd") || text.contains('$') {
        Some("USD")
    } else if lower.contains("gbp") || text.contains('£') {
        Some("GBP")
    } else {
        None
    }
}

fn extract_payment_status(lower: &str) -> Option<&'static str> {
    const PAID: [&str; 4] = ["zaplaceno", "paid", "bezahlt", "uhrazeno"];
    const UNPAID: [&str; 4] = ["nezaplaceno", "unpaid", "k úhradě", "splatno"];
    if PAID.iter().any(|p| lower.contains(p)) {
        Some("zaplaceno")
    } else if UNPAID.iter().any(|p| lower.contains(p)) {
        Some("nezaplaceno")
    } else {
        None
    }
}

fn extract_persons(text: &str, meta: &EmailMeta, fields: &mut FieldSet) {
    if let Some(name) = display_part(&meta.from) {
        fields.set_str("od_osoba", name);
    }
    if let Some(name) = display_part(&meta.to) {
        fields.set_str("pro_osoba", name);
    }
    for re in RE_SUPPLIER.iter() {
        if let Some(caps) = re.captures(text) {
            fields.set_str("od_firma", truncate(caps[1].trim(), 100));
            break;
        }
    }
    for re in RE_CUSTOMER.iter() {
        if let Some(caps) = re.captures(text) {
            fields.set_str("pro_firma", truncate(caps[1].trim(), 100));
            break;
        }
    }
}

/// `"Jan Novák <jan@example.cz>"` -> `Some("Jan Novák")`
fn display_part(header: &str) -> Option<String> {
    let (name, _) = header.split_once('<')?;
    let name = name.trim().trim_matches('"').trim_matches('\'').trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn extract_keywords(lower: &str) -> Option<String> {
    const KEYWORDS: [(&str, &str); 10] = [
        ("faktura", "faktur"),
        ("smlouva", "smlouv"),
        ("objednávka", "objednáv"),
        ("platba", "platb"),
        ("účet", "účet"),
        ("pojištění", "pojišt"),
        ("daň", "daň"),
        ("licence", "licenc"),
        ("služba", "služb"),
        ("zboží", "zboží"),
    ];
    let found: Vec<&str> = KEYWORDS
        .iter()
        .filter(|(_, stem)| lower.contains(stem))
        .map(|(kw, _)| *kw)
        .take(10)
        .collect();
    if found.is_empty() {
        None
    } else {
        Some(found.join(", "))
    }
}

fn extract_summary(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| l.len() > 20)
        .take(5)
        .find(|l| {
            let lower = l.to_lowercase();
            !["from:", "to:", "date:", "subject:", "---"]
                .iter()
                .any(|h| lower.contains(h))
                && l.chars().count() > 30
        })
        .map(|l| truncate(l, 200))
}

fn extract_service(lower: &str, fields: &mut FieldSet) {
    for (service_type, patterns) in SERVICE_TYPES {
        for pattern in *patterns {
            if let Some(pos) = lower.find(pattern) {
                fields.set_str("typ_sluzby", *service_type);
                let rest = &lower[pos + pattern.len()..];
                let name: String = rest
                    .trim_start_matches([':', ' '])
                    .chars()
                    .take_while(|c| *c != '\n' && *c != ',')
                    .take(50)
                    .collect();
                if name.trim().len() >= 3 {
                    fields.set_str("nazev_sluzby", name.trim().to_string());
                }
                return;
            }
        }
    }
}

fn extract_subject_type(text: &str, doc_kind: &str, fields: &mut FieldSet) {
    let typ = match doc_kind {
        "invoice" | "proforma" => Some("fakturace"),
        "contract" => Some("smlouva"),
        "order" => Some("objednávka"),
        _ => None,
    };
    if let Some(t) = typ {
        fields.set_str("predmet_typ", t);
    }
    for re in RE_SUBJECT_LINE.iter() {
        if let Some(caps) = re.captures(text) {
            fields.set_str("predmet_nazev", truncate(caps[1].trim(), 100));
            break;
        }
    }
}

fn extract_items(text: &str, fields: &mut FieldSet) {
    let mut items = Vec::new();
    for caps in RE_ITEMS.captures_iter(text).take(20) {
        let qty: Value = caps[2]
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(caps[2].to_string()));
        items.push(json!({
            "popis": truncate(caps[1].trim(), 100),
            "mnozstvi": qty,
            "cena": caps[3].replace(',', "."),
        }));
    }
    if items.is_empty() {
        return;
    }
    let text_form = items
        .iter()
        .take(10)
        .map(|i| {
            format!(
                "{} ({}x {})",
                i["popis"].as_str().unwrap_or(""),
                i["mnozstvi"],
                i["cena"].as_str().unwrap_or(""),
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    fields.set_str("polozky_text", text_form);
    fields.set_str(
        "polozky_json",
        serde_json::to_string(&items).unwrap_or_default(),
    );
}

fn extract_period(text: &str) -> Option<String> {
    if let Some(caps) = RE_PERIOD_MONTH.captures(text) {
        return Some(format!("{}/{}", &caps[1], &caps[2]));
    }
    if let Some(caps) = RE_PERIOD_YEAR.captures(text) {
        return Some(caps[1].to_string());
    }
    RE_PERIOD_BARE
        .captures(text)
        .map(|caps| format!("{}/{}", &caps[1], &caps[2]))
}

/// Truncate to a character budget without splitting a code point.
pub fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_INVOICE: &str = "\
FAKTURA č. 2024001234
Datum vystavení: 15.12.2024
Datum splatnosti: 29.12.2024

Dodavatel:
ABC Software s.r.o.
IČO: 12345678
DIČ: CZ12345678

Odběratel:
XYZ Company a.s.

Položky:
1. Licence software      12x   1,500.00
2. Technická podpora      1x  5,000.00

Celkem k úhradě: 23,000.00 CZK
VS: 2024001234
";

    fn sample_meta() -> EmailMeta {
        EmailMeta {
            from: "Jan Novák <jan@abc.cz>".to_string(),
            to: "info@xyz.com".to_string(),
            subject: "Faktura za software licence".to_string(),
            date: "2024-12-15".to_string(),
        }
    }

    #[test]
    fn extracts_invoice_core_fields() {
        let fields = extract_all(SAMPLE_INVOICE, &sample_meta(), "invoice");

        assert_eq!(fields.get_str("doc_typ"), Some("invoice"));
        assert_eq!(fields.get_str("cislo_dokumentu"), Some("2024001234"));
        assert_eq!(fields.get_str("protistrana_ico"), Some("12345678"));
        assert_eq!(fields.get_str("mena"), Some("CZK"));
        assert_eq!(fields.get_f64("castka_celkem"), Some(23000.0));
        assert_eq!(fields.get_str("datum_splatnosti"), Some("2024-12-29"));
        assert_eq!(fields.get_str("datum_dokumentu"), Some("2024-12-15"));
        assert_eq!(fields.get_str("kategorie"), Some("účetní"));
    }

    #[test]
    fn extracts_email_header_fields() {
        let fields = extract_all(SAMPLE_INVOICE, &sample_meta(), "invoice");

        assert_eq!(fields.get_str("email_from"), Some("Jan Novák <jan@abc.cz>"));
        assert_eq!(fields.get_str("od_osoba"), Some("Jan Novák"));
        assert_eq!(fields.get_str("predmet"), Some("Faktura za software licence"));
        // Address-only recipient has no display part.
        assert_eq!(fields.get_str("pro_osoba"), None);
    }

    #[test]
    fn extracts_line_items() {
        let fields = extract_all(SAMPLE_INVOICE, &sample_meta(), "invoice");

        let text = fields.get_str("polozky_text").unwrap();
        assert!(text.contains("Licence software"));
        let parsed: Vec<Value> =
            serde_json::from_str(fields.get_str("polozky_json").unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["mnozstvi"], json!(12));
    }

    #[test]
    fn all_fields_present_even_when_empty() {
        let fields = extract_all("", &EmailMeta::default(), "unknown");

        assert_eq!(fields.0.len(), 31);
        for name in FIELD_NAMES {
            assert!(fields.0.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn amount_with_thousands_separator() {
        let fields = extract_all(
            "Celkem: 1.234.567,89 Kč",
            &EmailMeta::default(),
            "invoice",
        );
        assert_eq!(fields.get_f64("castka_celkem"), Some(1_234_567.89));
    }

    #[test]
    fn payment_status_paid_wins_over_unpaid() {
        let fields = extract_all(
            "Faktura byla uhrazena. Zaplaceno dne 1.1.2025. Původně k úhradě.",
            &EmailMeta::default(),
            "invoice",
        );
        assert_eq!(fields.get_str("stav_platby"), Some("zaplaceno"));
    }

    #[test]
    fn variable_symbol_used_when_no_document_number() {
        let fields = extract_all(
            "Platba za služby\nVS: 98765432\nČástka: 500 Kč",
            &EmailMeta::default(),
            "payment_document",
        );
        assert_eq!(fields.get_str("cislo_dokumentu"), Some("98765432"));
    }

    #[test]
    fn service_type_detected() {
        let fields = extract_all(
            "Vaše objednávka hosting: webserver Standard byla prodloužena",
            &EmailMeta::default(),
            "invoice",
        );
        assert_eq!(fields.get_str("typ_sluzby"), Some("hosting"));
    }

    #[test]
    fn from_value_keeps_only_known_names() {
        let raw = json!({
            "doc_typ": "invoice",
            "castka_celkem": 120.5,
            "made_up_field": "x",
            "mena": null,
        });
        let fields = FieldSet::from_value(&raw);
        assert_eq!(fields.get_str("doc_typ"), Some("invoice"));
        assert_eq!(fields.get_f64("castka_celkem"), Some(120.5));
        assert!(!fields.0.contains_key("made_up_field"));
        assert_eq!(fields.get("mena"), None);
    }

    #[test]
    fn field_types_match_delivery_contract() {
        assert_eq!(field_type("castka_celkem"), FieldType::Float);
        assert_eq!(field_type("datum_dokumentu"), FieldType::Date);
        assert_eq!(field_type("datum_splatnosti"), FieldType::Date);
        assert_eq!(field_type("ai_summary"), FieldType::String);
    }
}
