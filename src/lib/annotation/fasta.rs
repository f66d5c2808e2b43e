//! Transcriptome reconciliation.
//!
//! kallisto numbers transcripts by their order of appearance in the FASTA
//! transcriptome it was given. To emit equivalence classes that use the same
//! numbering, the GTF-order indices are remapped onto FASTA header order.
//! GTF transcripts without a FASTA match keep working: they are appended
//! after the last FASTA index, in the order the GTF pass first saw them.

use anyhow::Result;
use log::warn;
use rustc_hash::FxHashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use super::{AnnotationBuilder, TranscriptIndex};
use crate::core::fs::open_text_reader;

/// Pull the transcript identifier out of a FASTA header line: the substring
/// between `>` and the first `.`, lower-cased (the whole remainder when no
/// `.` is present).
fn header_identifier(line: &str) -> Option<String> {
    let rest = line.strip_prefix('>')?;
    let lower = rest.to_lowercase();
    let id = match lower.find('.') {
        Some(dot) => &lower[..dot],
        None => &lower,
    };
    if id.is_empty() {
        None
    } else {
        Some(id.to_owned())
    }
}

/// Scan FASTA files in order, assigning each header the next index. The
/// first occurrence of a duplicated identifier wins, but every header still
/// consumes an index so later entries keep their file positions.
fn scan_headers(
    files: &[PathBuf],
    index_of: &mut FxHashMap<String, TranscriptIndex>,
) -> Result<TranscriptIndex> {
    let mut next: TranscriptIndex = 0;
    for path in files {
        scan_headers_file(path, index_of, &mut next)?;
    }
    Ok(next)
}

fn scan_headers_file(
    path: &Path,
    index_of: &mut FxHashMap<String, TranscriptIndex>,
    next: &mut TranscriptIndex,
) -> Result<()> {
    let reader = open_text_reader(path)?;
    for line in reader.lines() {
        let line = line?;
        if let Some(id) = header_identifier(&line) {
            index_of.entry(id).or_insert(*next);
            *next += 1;
        }
    }
    Ok(())
}

/// Remap the builder's transcript indices onto FASTA order and return the
/// total transcript count (FASTA entries plus appended GTF-only ones).
pub(crate) fn reconcile(
    builder: &mut AnnotationBuilder,
    transcriptome_files: &[PathBuf],
) -> Result<usize> {
    let mut fasta_index: FxHashMap<String, TranscriptIndex> = FxHashMap::default();
    let fasta_count = scan_headers(transcriptome_files, &mut fasta_index)?;

    let gtf_count = builder.transcript_count();
    if gtf_count > fasta_count as usize {
        warn!("GTF(s) contain more transcripts than the transcriptome file(s)");
    } else if gtf_count < fasta_count as usize {
        warn!("Transcriptome file(s) contain more transcripts than the GTF(s)");
    }

    let mut appended = fasta_count;
    let mut unmatched = 0usize;
    let remap: Vec<TranscriptIndex> = builder
        .transcript_ids()
        .iter()
        .map(|id| match fasta_index.get(id) {
            Some(&fasta_idx) => fasta_idx,
            None => {
                unmatched += 1;
                let idx = appended;
                appended += 1;
                idx
            }
        })
        .collect();
    if unmatched > 0 {
        warn!(
            "{} GTF transcript(s) missing from the transcriptome; appended after index {}",
            unmatched,
            fasta_count.saturating_sub(1)
        );
    }

    builder.apply_remap(&remap);
    Ok(appended as usize)
}
