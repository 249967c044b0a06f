//! Extract fields from a document text and render the ISDOC payload.

use std::fs;

use clap::Parser;

use lib_field_extract::{extract_all, EmailMeta};
use lib_isdoc::InvoiceData;

#[derive(Parser)]
#[command(name = "render-isdoc")]
#[command(about = "ISDOC rendering test harness")]
struct Args {
    /// Text file with the document content.
    file: String,
    /// Document identifier used when no number is extracted.
    #[arg(long, default_value = "document")]
    id: String,
    /// Document kind.
    #[arg(long, default_value = "invoice")]
    kind: String,
}

fn main() {
    let args = Args::parse();

    if !lib_isdoc::is_accounting_kind(&args.kind) {
        eprintln!("kind '{}' does not get an ISDOC payload", args.kind);
        std::process::exit(1);
    }

    let text = fs::read_to_string(&args.file).unwrap_or_else(|e| {
        eprintln!("cannot read {}: {e}", args.file);
        std::process::exit(1);
    });

    let fields = extract_all(&text, &EmailMeta::default(), &args.kind);
    let data = InvoiceData::from_fields(&args.id, &fields);
    print!("{}", lib_isdoc::render(&data));
}
