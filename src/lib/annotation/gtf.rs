//! Streaming GTF/GFF exon scan.
//!
//! Every line is lower-cased before parsing so that chromosome names and
//! transcript identifiers compare case-insensitively everywhere downstream.
//! Only `exon` features contribute; malformed lines are skipped rather than
//! aborting the pass.

use anyhow::Result;
use std::io::BufRead;
use std::path::Path;

use super::AnnotationBuilder;
use crate::core::fs::open_text_reader;

/// A parsed exon line. Coordinates are converted from the 1-based inclusive
/// GTF convention to 0-based half-open `[start, end)`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ExonLine<'a> {
    pub seqname: &'a str,
    pub transcript_id: &'a str,
    pub start: i64,
    pub end: i64,
}

/// Parse one (already lower-cased) annotation line. Returns `None` for
/// comments, non-exon features, and anything malformed.
pub(crate) fn parse_exon_line(line: &str) -> Option<ExonLine<'_>> {
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.split('\t');
    let seqname = fields.next()?;
    let _source = fields.next()?;
    let feature = fields.next()?;
    let start: i64 = fields.next()?.parse().ok()?;
    let end: i64 = fields.next()?.parse().ok()?;
    let _score = fields.next()?;
    let _strand = fields.next()?;
    let _frame = fields.next()?;
    let attributes = fields.next()?;

    if feature != "exon" || seqname.is_empty() || start < 1 || end < start {
        return None;
    }
    let transcript_id = attribute_value(attributes, "transcript_id")?;
    Some(ExonLine {
        seqname,
        transcript_id,
        start: start - 1,
        end,
    })
}

/// Extract an attribute value from column 9, accepting both the GTF
/// (`key "value";`) and GFF3 (`key=value;`) syntaxes.
fn attribute_value<'a>(attributes: &'a str, key: &str) -> Option<&'a str> {
    for part in attributes.split(';') {
        let part = part.trim();
        let rest = if let Some(rest) = part.strip_prefix(key) {
            rest
        } else {
            continue;
        };
        let rest = rest.trim_start();
        let rest = match rest.strip_prefix('=') {
            Some(r) => r.trim_start(),
            None if part.len() > key.len() && part.as_bytes()[key.len()].is_ascii_whitespace() => {
                rest
            }
            None => continue,
        };
        let value = rest.trim_matches('"');
        if !value.is_empty() {
            return Some(value);
        }
    }
    None
}

/// Scan one GTF/GFF file into the builder, registering every exon under its
/// transcript's running index.
pub(crate) fn scan_file(path: &Path, builder: &mut AnnotationBuilder) -> Result<()> {
    let reader = open_text_reader(path)?;
    for line in reader.lines() {
        let line = line?.to_lowercase();
        if let Some(exon) = parse_exon_line(&line) {
            builder.register_exon(exon.seqname, exon.transcript_id, exon.start, exon.end);
        }
    }
    Ok(())
}
