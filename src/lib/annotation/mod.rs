//! Genome annotation index
//!
//! Builds a per-chromosome exon index from one or more GTF/GFF files and
//! optionally reconciles transcript numbering against FASTA transcriptomes so
//! that equivalence classes match the indices kallisto would assign.
//!
//! Construction happens once, before any alignment is read:
//!
//! 1. [`gtf`] scans the annotation files in order and assigns a dense
//!    transcript index to every new `(seqname, transcript_id)` tuple.
//! 2. [`fasta`] (when transcriptomes are supplied) remaps those indices onto
//!    the FASTA header order, appending GTF-only transcripts at the end.
//! 3. `freeze` sorts the transcript sets and builds one interval index per
//!    chromosome.
//!
//! The frozen [`AnnotationIndex`] is immutable and shared read-only across
//! all reader workers.

pub mod fasta;
pub mod gtf;

use anyhow::Result;
use rust_lapper::{Interval, Lapper};
use rustc_hash::FxHashMap;
use std::path::PathBuf;

/// Dense transcript identifier. The k-th distinct `(seqname, transcript_id)`
/// tuple of the GTF pass receives index `k - 1`, unless a transcriptome
/// remaps it.
pub type TranscriptIndex = u32;

/// One exon interval, half-open `[start, end)` in 0-based reference
/// coordinates, carrying the transcripts that contain it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exon {
    pub start: i64,
    pub end: i64,
    /// Sorted and deduplicated once the index is frozen.
    pub transcripts: Vec<TranscriptIndex>,
}

/// All exons of one chromosome, in annotation input order, plus an interval
/// index over them for containment queries.
pub struct ChromosomeTable {
    exons: Vec<Exon>,
    lapper: Lapper<u64, usize>,
}

impl ChromosomeTable {
    fn new(exons: Vec<Exon>) -> Self {
        let intervals = exons
            .iter()
            .enumerate()
            .map(|(ordinal, exon)| Interval {
                start: exon.start as u64,
                stop: exon.end as u64,
                val: ordinal,
            })
            .collect();
        Self {
            exons,
            lapper: Lapper::new(intervals),
        }
    }

    /// Exons in annotation input order.
    pub fn exons(&self) -> &[Exon] {
        &self.exons
    }

    /// All exons that fully contain `[start, end)`.
    ///
    /// Zero-length query intervals never match in the interval index, so
    /// they fall back to a direct scan to keep containment semantics exact.
    pub fn containing(&self, start: i64, end: i64) -> Vec<&Exon> {
        if start >= end {
            return self
                .exons
                .iter()
                .filter(|e| start >= e.start && end <= e.end)
                .collect();
        }
        let mut ordinals: Vec<usize> = self
            .lapper
            .find(start as u64, end as u64)
            .filter(|iv| start >= iv.start as i64 && end <= iv.stop as i64)
            .map(|iv| iv.val)
            .collect();
        // Lapper yields hits in sorted-interval order; restore input order.
        ordinals.sort_unstable();
        ordinals.into_iter().map(|i| &self.exons[i]).collect()
    }
}

/// Mutable state while the GTF/FASTA passes run; frozen into an
/// [`AnnotationIndex`] afterwards.
#[derive(Default)]
pub struct AnnotationBuilder {
    chromosomes: FxHashMap<String, ChromosomeDraft>,
    /// Transcript identifier (lower-cased) per GTF-order index.
    transcript_ids: Vec<String>,
    prev_tuple: Option<(String, String)>,
}

#[derive(Default)]
struct ChromosomeDraft {
    exons: Vec<Exon>,
    by_span: FxHashMap<(i64, i64), usize>,
}

impl AnnotationBuilder {
    /// Record one exon line. Allocates a new transcript index whenever the
    /// `(seqname, transcript_id)` tuple differs from the previous line's.
    pub fn register_exon(&mut self, seqname: &str, transcript_id: &str, start: i64, end: i64) {
        let tuple = (seqname.to_owned(), transcript_id.to_owned());
        if self.prev_tuple.as_ref() != Some(&tuple) {
            self.transcript_ids.push(transcript_id.to_owned());
            self.prev_tuple = Some(tuple);
        }
        let index = (self.transcript_ids.len() - 1) as TranscriptIndex;

        let draft = self.chromosomes.entry(seqname.to_owned()).or_default();
        match draft.by_span.entry((start, end)) {
            std::collections::hash_map::Entry::Occupied(slot) => {
                draft.exons[*slot.get()].transcripts.push(index);
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(draft.exons.len());
                draft.exons.push(Exon {
                    start,
                    end,
                    transcripts: vec![index],
                });
            }
        }
    }

    /// Number of distinct transcripts observed so far.
    pub fn transcript_count(&self) -> usize {
        self.transcript_ids.len()
    }

    pub(crate) fn transcript_ids(&self) -> &[String] {
        &self.transcript_ids
    }

    /// Replace every transcript index `i` with `remap[i]`.
    pub(crate) fn apply_remap(&mut self, remap: &[TranscriptIndex]) {
        for draft in self.chromosomes.values_mut() {
            for exon in &mut draft.exons {
                for tx in &mut exon.transcripts {
                    *tx = remap[*tx as usize];
                }
            }
        }
    }

    /// Sort transcript sets, build the per-chromosome interval indexes, and
    /// seal the result.
    pub fn freeze(self, num_transcripts: usize) -> AnnotationIndex {
        let chromosomes = self
            .chromosomes
            .into_iter()
            .map(|(name, mut draft)| {
                for exon in &mut draft.exons {
                    exon.transcripts.sort_unstable();
                    exon.transcripts.dedup();
                }
                (name, ChromosomeTable::new(draft.exons))
            })
            .collect();
        AnnotationIndex {
            chromosomes,
            num_transcripts,
        }
    }
}

/// Read-only exon index over all chromosomes. Safe to share across worker
/// threads once constructed.
pub struct AnnotationIndex {
    chromosomes: FxHashMap<String, ChromosomeTable>,
    num_transcripts: usize,
}

impl AnnotationIndex {
    /// Build the index from GTF/GFF files, optionally reconciling transcript
    /// numbering against FASTA transcriptomes.
    pub fn from_files(gtf_files: &[PathBuf], transcriptome_files: &[PathBuf]) -> Result<Self> {
        let mut builder = AnnotationBuilder::default();
        for path in gtf_files {
            gtf::scan_file(path, &mut builder)?;
        }
        let num_transcripts = if transcriptome_files.is_empty() {
            builder.transcript_count()
        } else {
            fasta::reconcile(&mut builder, transcriptome_files)?
        };
        Ok(builder.freeze(num_transcripts))
    }

    /// An index with no annotation, used when transcript indices come from
    /// the alignment `tid` instead (rapmap mode without GTFs).
    pub fn empty() -> Self {
        Self {
            chromosomes: FxHashMap::default(),
            num_transcripts: 0,
        }
    }

    /// Look up a chromosome by its lower-cased name.
    pub fn chromosome(&self, name: &str) -> Option<&ChromosomeTable> {
        self.chromosomes.get(name)
    }

    pub fn num_chromosomes(&self) -> usize {
        self.chromosomes.len()
    }

    pub fn num_transcripts(&self) -> usize {
        self.num_transcripts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_indices_per_tuple_change() {
        let mut builder = AnnotationBuilder::default();
        builder.register_exon("chr1", "t1", 0, 100);
        builder.register_exon("chr1", "t1", 200, 300);
        builder.register_exon("chr1", "t2", 0, 100);
        builder.register_exon("chr2", "t2", 0, 50);
        // Same id reappearing after an interruption counts as a new tuple.
        builder.register_exon("chr1", "t1", 400, 500);
        assert_eq!(builder.transcript_count(), 4);

        let index = builder.freeze(4);
        let chr1 = index.chromosome("chr1").unwrap();
        assert_eq!(chr1.exons()[0].transcripts, vec![0, 1]);
    }

    #[test]
    fn duplicate_spans_merge_transcript_sets() {
        let mut builder = AnnotationBuilder::default();
        builder.register_exon("chr1", "t1", 10, 20);
        builder.register_exon("chr1", "t2", 10, 20);
        builder.register_exon("chr1", "t3", 30, 40);
        let index = builder.freeze(3);
        let chr1 = index.chromosome("chr1").unwrap();
        assert_eq!(chr1.exons().len(), 2);
        assert_eq!(chr1.exons()[0].transcripts, vec![0, 1]);
    }

    #[test]
    fn containment_queries_match_direct_scan() {
        let mut builder = AnnotationBuilder::default();
        builder.register_exon("chr1", "t1", 99, 200);
        builder.register_exon("chr1", "t2", 149, 250);
        let index = builder.freeze(2);
        let chr1 = index.chromosome("chr1").unwrap();

        let hits = chr1.containing(159, 189);
        assert_eq!(hits.len(), 2);
        let hits = chr1.containing(99, 149);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].transcripts, vec![0]);
        assert!(chr1.containing(90, 260).is_empty());
        // Zero-length interval sits inside both exons.
        assert_eq!(chr1.containing(160, 160).len(), 2);
    }

    #[test]
    fn missing_chromosome_is_none() {
        let index = AnnotationIndex::empty();
        assert!(index.chromosome("chr1").is_none());
    }
}
