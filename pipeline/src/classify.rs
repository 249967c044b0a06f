//! Document kinds and the precedence-ordered rule classifier.
//!
//! Rules are compiled once at startup. Classification walks the table in
//! descending precedence and the first rule with a positive match and no
//! negative match wins; notification senders short-circuit everything.

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::config::RuleOverride;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DocumentKind {
    Invoice,
    Receipt,
    TaxDocument,
    BankStatement,
    Order,
    Contract,
    ParkingTicket,
    CarService,
    CarWash,
    GlassWork,
    Proforma,
    DeliveryNote,
    PaymentDocument,
    SystemNotification,
    Marketing,
    Correspondence,
    ItNotes,
    ProjectNotes,
    Unknown,
}

impl DocumentKind {
    pub fn is_accounting(self) -> bool {
        lib_isdoc::is_accounting_kind(&self.to_string())
    }

    /// Czech tag / document-type label on the delivery side.
    pub fn czech_label(self) -> &'static str {
        match self {
            DocumentKind::Invoice => "Faktura",
            DocumentKind::Receipt => "Účtenka",
            DocumentKind::TaxDocument => "Daňový doklad",
            DocumentKind::BankStatement => "Bankovní výpis",
            DocumentKind::Order => "Objednávka",
            DocumentKind::Contract => "Smlouva",
            DocumentKind::ParkingTicket => "Parkovné",
            DocumentKind::CarService => "Autoservis",
            DocumentKind::CarWash => "Myčka",
            DocumentKind::GlassWork => "Sklenářství",
            DocumentKind::Proforma => "Proforma",
            DocumentKind::DeliveryNote => "Dodací list",
            DocumentKind::PaymentDocument => "Platební doklad",
            DocumentKind::SystemNotification => "Systémová notifikace",
            DocumentKind::Marketing => "Marketing",
            DocumentKind::Correspondence => "Korespondence",
            DocumentKind::ItNotes => "IT poznámky",
            DocumentKind::ProjectNotes => "Projektové poznámky",
            DocumentKind::Unknown => "Ostatní",
        }
    }

    /// Kinds offered in the manual-review menu, in display order.
    pub fn selectable() -> Vec<DocumentKind> {
        DocumentKind::iter()
            .filter(|k| *k != DocumentKind::Unknown)
            .collect()
    }
}

struct KindRule {
    kind: DocumentKind,
    priority: i32,
    patterns: Vec<Regex>,
    negative: Vec<Regex>,
}

/// Built-in rule table. Precedence resolves overlaps explicitly: narrow
/// vehicle/accounting kinds outrank invoice, invoice outranks receipt, and
/// the broad correspondence/marketing kinds sit at the bottom.
fn default_rule_specs() -> Vec<(DocumentKind, i32, Vec<&'static str>, Vec<&'static str>)> {
    use DocumentKind::*;
    vec![
        (
            ParkingTicket,
            90,
            vec![r"parkovné", r"parkovací\s+lístek", r"parking\s+(ticket|fee)"],
            vec![],
        ),
        (
            CarService,
            88,
            vec![r"autoservis", r"servis\s+vozidla", r"výměna\s+oleje", r"\bstk\b"],
            vec![],
        ),
        (CarWash, 86, vec![r"myčk[ay]", r"mytí\s+voz[iu]", r"car\s*wash"], vec![]),
        (
            GlassWork,
            84,
            vec![r"autosklo", r"sklenářstv", r"výměna\s+(čelního\s+)?skla"],
            vec![],
        ),
        (
            Proforma,
            82,
            vec![r"proforma", r"zálohov[áé]\s+faktur[ay]"],
            vec![],
        ),
        (
            TaxDocument,
            80,
            vec![r"daňov[ýé]\s+přiznání", r"tax\s+return", r"kontrolní\s+hlášení"],
            vec![],
        ),
        (
            BankStatement,
            78,
            vec![r"výpis\s+z\s+účtu", r"bank\s+statement", r"kontoauszug", r"zůstatek"],
            vec![],
        ),
        (
            Invoice,
            70,
            vec![
                r"faktur[ayu]",
                r"invoice",
                r"rechnung",
                r"daňový\s+doklad",
                r"variabilní\s+symbol",
                r"celkem\s+k\s+úhradě",
                r"datum\s+splatnosti",
            ],
            vec![r"proforma", r"zálohov"],
        ),
        (
            Receipt,
            68,
            vec![r"účtenk[ay]", r"pokladní\s+doklad", r"receipt", r"paragon", r"stvrzenka"],
            vec![],
        ),
        (
            PaymentDocument,
            66,
            vec![r"potvrzení\s+o\s+platbě", r"payment\s+confirmation", r"platba\s+přijata"],
            vec![],
        ),
        (
            DeliveryNote,
            64,
            vec![r"dodací\s+list", r"delivery\s+note", r"lieferschein", r"předávací\s+protokol"],
            vec![],
        ),
        (
            Order,
            62,
            vec![r"objednávk[ayu]", r"purchase\s+order", r"bestellung", r"č\.\s*obj"],
            vec![],
        ),
        (
            Contract,
            60,
            vec![r"smlouv[ayu]", r"contract", r"vertrag", r"smluvní\s+strany"],
            vec![],
        ),
        (
            ItNotes,
            40,
            vec![r"deployment", r"pull\s+request", r"incident\s+report", r"server\s+log"],
            vec![],
        ),
        (
            ProjectNotes,
            38,
            vec![r"zápis\s+z\s+jednání", r"project\s+plan", r"milestone", r"meeting\s+notes"],
            vec![],
        ),
        (
            Marketing,
            20,
            vec![r"newsletter", r"\bsleva\b", r"discount", r"unsubscribe", r"odhlásit"],
            vec![],
        ),
        (
            Correspondence,
            10,
            vec![r"vážen[ýá]", r"dear", r"dobrý\s+den", r"s\s+pozdravem", r"regards"],
            vec![],
        ),
    ]
}

/// Sender patterns that mark automated system notifications. These take
/// precedence over every content rule and bypass all later analyzer phases.
const NOTIFICATION_SENDERS: [&str; 5] = [
    r"^noreply@",
    r"^no-reply@",
    r"^notifications?@",
    r"@loxone\.com$",
    r"@ubnt\.com$",
];

pub struct Classifier {
    rules: Vec<KindRule>,
    notification_senders: Vec<Regex>,
}

impl Classifier {
    pub fn new(overrides: &[RuleOverride]) -> Self {
        let mut rules: Vec<KindRule> = default_rule_specs()
            .into_iter()
            .map(|(kind, priority, patterns, negative)| KindRule {
                kind,
                priority,
                patterns: compile_all(&patterns),
                negative: compile_all(&negative),
            })
            .collect();

        for o in overrides {
            let Ok(kind) = o.kind.parse::<DocumentKind>() else {
                tracing::warn!("ignoring rule override for unknown kind '{}'", o.kind);
                continue;
            };
            rules.push(KindRule {
                kind,
                priority: o.priority,
                patterns: o.patterns.iter().map(|p| compile(p)).collect(),
                negative: o.negative.iter().map(|p| compile(p)).collect(),
            });
        }

        // Descending precedence; table order breaks ties.
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));

        Classifier {
            rules,
            notification_senders: NOTIFICATION_SENDERS.iter().map(|p| compile(p)).collect(),
        }
    }

    /// Classify by sender and text. Returns the kind with a confidence in
    /// [0, 1]; `Unknown` means no rule matched.
    pub fn classify(&self, sender_address: &str, text: &str) -> (DocumentKind, f32) {
        let sender = sender_address.to_lowercase();
        if self
            .notification_senders
            .iter()
            .any(|re| re.is_match(&sender))
        {
            return (DocumentKind::SystemNotification, 0.99);
        }

        let lower = text.to_lowercase();
        for rule in &self.rules {
            if rule.negative.iter().any(|re| re.is_match(&lower)) {
                continue;
            }
            let matches: usize = rule
                .patterns
                .iter()
                .map(|re| re.find_iter(&lower).count())
                .sum();
            if matches > 0 {
                let confidence = (0.3 + 0.1 * matches as f32).min(0.95);
                return (rule.kind, confidence);
            }
        }

        (DocumentKind::Unknown, 0.0)
    }
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid kind rule pattern '{pattern}': {e}"))
}

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| compile(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(&[])
    }

    #[test]
    fn kind_string_forms_are_snake_case() {
        assert_eq!(DocumentKind::SystemNotification.to_string(), "system_notification");
        assert_eq!("tax_document".parse::<DocumentKind>().unwrap(), DocumentKind::TaxDocument);
        assert_eq!(
            serde_json::to_string(&DocumentKind::BankStatement).unwrap(),
            "\"bank_statement\""
        );
    }

    #[test]
    fn notification_sender_wins_over_content() {
        let c = classifier();
        let (kind, confidence) =
            c.classify("noreply@loxone.com", "Statistic report faktura celkem k úhradě");
        assert_eq!(kind, DocumentKind::SystemNotification);
        assert!((confidence - 0.99).abs() < f32::EPSILON);
    }

    #[test]
    fn invoice_text_classifies_as_invoice() {
        let c = classifier();
        let (kind, confidence) = c.classify(
            "jan@abc.cz",
            "Faktura č. 2024-001, variabilní symbol 123, celkem k úhradě 1200 Kč",
        );
        assert_eq!(kind, DocumentKind::Invoice);
        assert!(confidence > 0.3);
    }

    #[test]
    fn proforma_outranks_invoice() {
        let c = classifier();
        let (kind, _) = c.classify("jan@abc.cz", "Zálohová faktura - proforma č. 55");
        assert_eq!(kind, DocumentKind::Proforma);
    }

    #[test]
    fn parking_outranks_receipt() {
        // A parking receipt matches both tables; the narrower kind wins.
        let c = classifier();
        let (kind, _) = c.classify("jan@abc.cz", "Účtenka za parkovné, zóna 2");
        assert_eq!(kind, DocumentKind::ParkingTicket);
    }

    #[test]
    fn unmatched_text_is_unknown() {
        let c = classifier();
        let (kind, confidence) = c.classify("jan@abc.cz", "xyzzy plugh 123");
        assert_eq!(kind, DocumentKind::Unknown);
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn override_rules_are_merged() {
        let overrides = vec![RuleOverride {
            kind: "invoice".to_string(),
            priority: 95,
            patterns: vec![r"vyúčtování".to_string()],
            negative: vec![],
        }];
        let c = Classifier::new(&overrides);
        let (kind, _) = c.classify("jan@abc.cz", "Vyúčtování za služby");
        assert_eq!(kind, DocumentKind::Invoice);
    }

    #[test]
    fn accounting_kinds() {
        assert!(DocumentKind::Invoice.is_accounting());
        assert!(DocumentKind::BankStatement.is_accounting());
        assert!(!DocumentKind::Marketing.is_accounting());
    }
}
