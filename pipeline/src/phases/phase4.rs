//! Phase 4: manual review of everything the analyzers could not classify.
//!
//! A terminal loop over the phase-3 failure stream. The reviewer assigns a
//! kind; field extraction then runs over the re-read envelope text and the
//! artifact is shaped exactly like the automated phases' output.

use std::fs;
use std::io::{self, BufRead, Write};

use chrono::Utc;

use lib_field_extract as field_extract;

use crate::classify::DocumentKind;
use crate::error::PipelineResult;
use crate::mail;
use crate::store::claim::{claim, ClaimOutcome};
use crate::store::scan::InputItem;
use crate::store::{Artifact, FailureRecord};

use super::{PhaseStats, WorkerCtx};

use crate::phases::phase1::{content_md5, hex_sha256};

pub struct ReviewSession {
    kinds: Vec<DocumentKind>,
}

impl Default for ReviewSession {
    fn default() -> Self {
        ReviewSession {
            kinds: DocumentKind::selectable(),
        }
    }
}

enum ReviewCommand {
    Assign(DocumentKind),
    Skip,
    Quit,
}

impl ReviewSession {
    pub async fn run(
        &self,
        ctx: &mut WorkerCtx,
        records: &[FailureRecord],
        items_by_id: &dyn Fn(&str) -> Option<InputItem>,
    ) -> PipelineResult<PhaseStats> {
        let mut stats = PhaseStats::new(4, ctx.instance);
        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();

        println!("{} items awaiting manual review", records.len());
        self.print_menu();

        for record in records {
            let guard = match claim(&ctx.store, 4, &record.item_id, &ctx.host, ctx.stale_lock_ttl)
            {
                Ok(ClaimOutcome::Claimed(guard)) => guard,
                Ok(_) => {
                    stats.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!("claim failed for {}: {e}", record.item_id);
                    continue;
                }
            };

            let (meta, text, item) = load_item(record, items_by_id);

            println!();
            println!("item:    {}", record.item_id);
            println!("from:    {}", meta.from);
            println!("subject: {}", meta.subject);
            println!("reason:  {}", record.reason);
            println!("text:    {}", field_extract::truncate(&text, 400));
            print!("kind (number, name, s=skip, q=quit)> ");
            io::stdout().flush()?;

            let command = loop {
                let Some(line) = lines.next() else {
                    break ReviewCommand::Quit;
                };
                match self.parse_command(&line?) {
                    Some(command) => break command,
                    None => {
                        print!("unrecognized, try again> ");
                        io::stdout().flush()?;
                    }
                }
            };

            match command {
                ReviewCommand::Quit => {
                    guard.release()?;
                    break;
                }
                ReviewCommand::Skip => {
                    stats.skipped += 1;
                    guard.release()?;
                    continue;
                }
                ReviewCommand::Assign(kind) => {
                    stats.processed += 1;
                    let fields = field_extract::extract_all(&text, &meta, &kind.to_string());
                    let artifact = Artifact {
                        item_id: record.item_id.clone(),
                        phase: 4,
                        doc_kind: kind,
                        fields,
                        raw_text_sha256: hex_sha256(&text),
                        content_md5: item
                            .as_ref()
                            .and_then(|i| content_md5(i).ok())
                            .unwrap_or_default(),
                        confidence: 1.0,
                        escalation_trace: None,
                        timestamp: Utc::now(),
                    };
                    if kind.is_accounting() {
                        let data =
                            lib_isdoc::InvoiceData::from_fields(&record.item_id, &artifact.fields);
                        ctx.store
                            .write_xml(&record.item_id, &lib_isdoc::render(&data))?;
                    }
                    ctx.store.write_artifact(&artifact)?;
                    stats.succeeded += 1;
                    stats.count_kind(kind);
                    println!("saved as {kind}");
                    guard.release()?;
                }
            }
        }

        stats.log_summary();
        Ok(stats)
    }

    fn print_menu(&self) {
        for (i, kind) in self.kinds.iter().enumerate() {
            println!("{:2}. {} ({})", i + 1, kind, kind.czech_label());
        }
    }

    fn parse_command(&self, line: &str) -> Option<ReviewCommand> {
        let line = line.trim();
        match line {
            "q" | "quit" => return Some(ReviewCommand::Quit),
            "s" | "skip" | "" => return Some(ReviewCommand::Skip),
            _ => {}
        }
        if let Ok(index) = line.parse::<usize>() {
            return self
                .kinds
                .get(index.checked_sub(1)?)
                .map(|k| ReviewCommand::Assign(*k));
        }
        line.parse::<DocumentKind>()
            .ok()
            .map(ReviewCommand::Assign)
    }
}

fn load_item(
    record: &FailureRecord,
    items_by_id: &dyn Fn(&str) -> Option<InputItem>,
) -> (
    lib_field_extract::EmailMeta,
    String,
    Option<InputItem>,
) {
    if let Some(item) = items_by_id(&record.item_id) {
        if let Some(path) = item.eml_path() {
            if let Ok(raw) = fs::read(&path) {
                if let Ok(parsed) = mail::parse_eml(&raw) {
                    let body = if parsed.envelope.body.is_empty() {
                        record.snippet.clone()
                    } else {
                        parsed.envelope.body.clone()
                    };
                    return (parsed.envelope.meta(), body, Some(item));
                }
            }
        }
        return (Default::default(), record.snippet.clone(), Some(item));
    }
    (Default::default(), record.snippet.clone(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse() {
        let session = ReviewSession::default();

        assert!(matches!(
            session.parse_command("q"),
            Some(ReviewCommand::Quit)
        ));
        assert!(matches!(
            session.parse_command("s"),
            Some(ReviewCommand::Skip)
        ));
        assert!(matches!(
            session.parse_command("invoice"),
            Some(ReviewCommand::Assign(DocumentKind::Invoice))
        ));
        assert!(matches!(
            session.parse_command("1"),
            Some(ReviewCommand::Assign(DocumentKind::Invoice))
        ));
        assert!(session.parse_command("999").is_none());
        assert!(session.parse_command("gibberish").is_none());
    }

    #[test]
    fn menu_excludes_unknown() {
        let session = ReviewSession::default();
        assert!(!session.kinds.contains(&DocumentKind::Unknown));
        assert_eq!(session.kinds[0], DocumentKind::Invoice);
    }
}
