//! Rendering of accounting artifacts as ISDOC-shaped XML payloads.
//!
//! Only the subset of the schema the downstream accounting import needs is
//! emitted; the schema itself is an external contract.

use chrono::NaiveDate;
use indoc::formatdoc;
use lib_field_extract::FieldSet;

/// Document kinds that get a structured XML payload.
const ACCOUNTING_KINDS: [&str; 4] = ["invoice", "receipt", "tax_document", "bank_statement"];

pub fn is_accounting_kind(doc_kind: &str) -> bool {
    ACCOUNTING_KINDS.contains(&doc_kind)
}

/// Invoice-shaped data distilled from the 31 extracted fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoiceData {
    pub document_id: String,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub total_amount: Option<f64>,
    pub currency: String,
    pub supplier_name: Option<String>,
    pub supplier_ico: Option<String>,
    pub note: Option<String>,
}

impl InvoiceData {
    /// Populate from an artifact's field set. `item_id` is the fallback
    /// document identifier when no document number was extracted.
    pub fn from_fields(item_id: &str, fields: &FieldSet) -> Self {
        InvoiceData {
            document_id: fields
                .get_str("cislo_dokumentu")
                .unwrap_or(item_id)
                .to_string(),
            issue_date: fields
                .get_str("datum_dokumentu")
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
            due_date: fields
                .get_str("datum_splatnosti")
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
            total_amount: fields.get_f64("castka_celkem"),
            currency: fields.get_str("mena").unwrap_or("CZK").to_string(),
            supplier_name: fields.get_str("protistrana_nazev").map(String::from),
            supplier_ico: fields.get_str("protistrana_ico").map(String::from),
            note: fields.get_str("polozky_text").map(String::from),
        }
    }
}

/// Render the ISDOC XML payload.
pub fn render(data: &InvoiceData) -> String {
    let issue_date = data
        .issue_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let due_date = data
        .due_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let total = data
        .total_amount
        .map(|a| format!("{a:.2}"))
        .unwrap_or_default();
    let note = data
        .note
        .as_deref()
        .map(|n| format!("  <Note>{}</Note>\n", escape(n)))
        .unwrap_or_default();

    formatdoc! {r#"
        <?xml version="1.0" encoding="utf-8"?>
        <Invoice xmlns="http://isdoc.cz/namespace/2013" version="6.0.1">
          <DocumentType>1</DocumentType>
          <ID>{id}</ID>
          <IssueDate>{issue_date}</IssueDate>
          <LocalCurrencyCode>{currency}</LocalCurrencyCode>
          <AccountingSupplierParty>
            <Party>
              <PartyIdentification>
                <ID>{ico}</ID>
              </PartyIdentification>
              <PartyName>
                <Name>{name}</Name>
              </PartyName>
            </Party>
          </AccountingSupplierParty>
          <LegalMonetaryTotal>
            <TaxInclusiveAmount>{total}</TaxInclusiveAmount>
            <PayableAmount>{total}</PayableAmount>
          </LegalMonetaryTotal>
          <PaymentMeans>
            <Payment>
              <Details>
                <PaymentDueDate>{due_date}</PaymentDueDate>
              </Details>
            </Payment>
          </PaymentMeans>
        {note}</Invoice>
        "#,
        id = escape(&data.document_id),
        currency = escape(&data.currency),
        ico = escape(data.supplier_ico.as_deref().unwrap_or("")),
        name = escape(data.supplier_name.as_deref().unwrap_or("")),
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
