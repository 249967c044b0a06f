//! Run the 31-field extractor over a text file or inline text and print the
//! populated fields.

use std::fs;

use clap::Parser;

use lib_field_extract::{extract_all, EmailMeta};

#[derive(Parser)]
#[command(name = "extract-fields")]
#[command(about = "Field extractor test harness")]
struct Args {
    /// Text file to extract from.
    #[arg(long, conflicts_with = "text")]
    file: Option<String>,
    /// Direct text input.
    #[arg(long)]
    text: Option<String>,
    /// Document kind to assume.
    #[arg(long, default_value = "invoice")]
    kind: String,
    /// Envelope From header.
    #[arg(long, default_value = "")]
    from: String,
    /// Envelope Subject header.
    #[arg(long, default_value = "")]
    subject: String,
}

fn main() {
    let args = Args::parse();

    let text = match (&args.file, &args.text) {
        (Some(path), _) => fs::read_to_string(path).unwrap_or_else(|e| {
            eprintln!("cannot read {path}: {e}");
            std::process::exit(1);
        }),
        (None, Some(text)) => text.clone(),
        (None, None) => {
            eprintln!("pass --file or --text");
            std::process::exit(1);
        }
    };

    let meta = EmailMeta {
        from: args.from,
        subject: args.subject,
        ..Default::default()
    };

    let fields = extract_all(&text, &meta, &args.kind);
    for (name, value) in &fields.0 {
        if !value.is_null() {
            println!("{name:<20} {value}");
        }
    }
}
