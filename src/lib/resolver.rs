//! Equivalence-class resolution
//!
//! Three layers, mirroring how reads relate to alignments:
//!
//! - the CIGAR splitter turns one alignment record into the reference
//!   intervals it covers ([`alignment_intervals`]);
//! - [`single_alignment_ec`] intersects the transcript candidates of those
//!   intervals against the annotation index;
//! - [`read_ec`] combines all alignments of a read (or read pair), honouring
//!   strand buckets, orphan suppression, and the configured pairing mode.
//!
//! Transcript sets are kept as sorted `Vec`s throughout; the sets involved
//! are small and merge-walk intersection beats hashing at these sizes.

use itertools::Itertools;
use rust_htslib::bam::record::Cigar;
use rust_htslib::bam::{HeaderView, Record};

use crate::annotation::{AnnotationIndex, TranscriptIndex};

/// Per-file resolution switches.
#[derive(Debug, Clone, Copy)]
pub struct EcConfig {
    /// Reads are paired-end; intersect mate ECs.
    pub paired: bool,
    /// Transcript indices come straight from the alignment `tid`.
    pub rapmap: bool,
    /// Strict splice matching and strand-aware pairing (the default mode
    /// mirrors kallisto's genome-BAM behaviour, which requires neither).
    pub strict: bool,
}

/// Lower-cased contig names of one alignment file, indexed by `tid`.
pub struct ContigNames(Vec<String>);

impl ContigNames {
    pub fn from_header(header: &HeaderView) -> Self {
        let names = (0..header.target_count())
            .map(|tid| String::from_utf8_lossy(header.tid2name(tid)).to_lowercase())
            .collect();
        Self(names)
    }

    pub fn from_names<S: Into<String>>(names: Vec<S>) -> Self {
        Self(names.into_iter().map(|n| n.into().to_lowercase()).collect())
    }

    pub fn get(&self, tid: i32) -> Option<&str> {
        usize::try_from(tid)
            .ok()
            .and_then(|tid| self.0.get(tid))
            .map(|name| name.as_str())
    }
}

/// Every alignment of one read (or read pair), bucketed by template segment.
#[derive(Default)]
pub struct ReadGroup {
    pub seg0: Vec<Record>,
    pub seg1: Vec<Record>,
}

impl ReadGroup {
    /// Bucket a record by its "last segment in template" flag.
    pub fn push(&mut self, record: Record) {
        if record.is_last_in_template() {
            self.seg1.push(record);
        } else {
            self.seg0.push(record);
        }
    }

    pub fn clear(&mut self) {
        self.seg0.clear();
        self.seg1.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.seg0.is_empty() && self.seg1.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.seg0.iter().chain(self.seg1.iter())
    }
}

/// Split an alignment into reference intervals using reference-consuming
/// CIGAR semantics: M/D/=/X extend the current interval, N closes it and
/// skips, everything else is ignored.
pub fn alignment_intervals(record: &Record) -> Vec<(i64, i64)> {
    let mut intervals = Vec::new();
    let mut start = record.pos();
    let mut end = start;
    for op in record.cigar().iter() {
        match *op {
            Cigar::Match(len) | Cigar::Del(len) | Cigar::Equal(len) | Cigar::Diff(len) => {
                end += i64::from(len);
            }
            Cigar::RefSkip(len) => {
                intervals.push((start, end));
                start = end + i64::from(len);
                end = start;
            }
            Cigar::Ins(_) | Cigar::SoftClip(_) | Cigar::HardClip(_) | Cigar::Pad(_) => {}
        }
    }
    intervals.push((start, end));
    intervals
}

/// Equivalence class of a single alignment: the intersection over its
/// reference intervals of the transcripts whose exons contain them.
pub fn single_alignment_ec(
    index: &AnnotationIndex,
    contig: &str,
    record: &Record,
    strict_splice: bool,
) -> Vec<TranscriptIndex> {
    let chromosome = match index.chromosome(contig) {
        Some(table) => table,
        None => return Vec::new(),
    };

    let intervals = alignment_intervals(record);
    if intervals.len() == 1 && intervals[0].0 == intervals[0].1 {
        // Nothing in the CIGAR consumed reference bases.
        return Vec::new();
    }

    let last = intervals.len() - 1;
    let mut ec: Option<Vec<TranscriptIndex>> = None;
    for (j, &(start, end)) in intervals.iter().enumerate() {
        let mut candidates: Vec<TranscriptIndex> = Vec::new();
        for exon in chromosome.containing(start, end) {
            // Interior interval ends must land exactly on splice sites in
            // strict mode; the outer read ends are free.
            if strict_splice
                && !((j == 0 || start == exon.start) && (j == last || end == exon.end))
            {
                continue;
            }
            candidates.extend_from_slice(&exon.transcripts);
        }
        candidates.sort_unstable();
        candidates.dedup();
        let next = match ec {
            None => candidates,
            Some(previous) => intersect_sorted(&previous, &candidates),
        };
        if next.is_empty() {
            return Vec::new();
        }
        ec = Some(next);
    }
    ec.unwrap_or_default()
}

/// Equivalence class of a whole read group.
pub fn read_ec(
    index: &AnnotationIndex,
    contigs: &ContigNames,
    group: &ReadGroup,
    config: &EcConfig,
) -> Vec<TranscriptIndex> {
    if config.paired && (all_unmapped(&group.seg0) || all_unmapped(&group.seg1)) {
        // Orphans never produce an EC.
        return Vec::new();
    }

    let (forward0, reverse0) = segment_buckets(index, contigs, &group.seg0, config);
    let (forward1, reverse1) = segment_buckets(index, contigs, &group.seg1, config);

    let mut ec = if !config.paired {
        let (forward, reverse) = if forward0.is_empty() && reverse0.is_empty() {
            (forward1, reverse1)
        } else {
            (forward0, reverse0)
        };
        union_sorted(forward, reverse)
    } else if config.strict {
        let forward0 = sorted(forward0);
        let reverse0 = sorted(reverse0);
        let forward1 = sorted(forward1);
        let reverse1 = sorted(reverse1);
        let mut joined = intersect_sorted(&forward0, &reverse1);
        joined.extend(intersect_sorted(&reverse0, &forward1));
        joined.sort_unstable();
        joined
    } else {
        let first = union_sorted(forward0, reverse0);
        let second = union_sorted(forward1, reverse1);
        intersect_sorted(&first, &second)
    };
    ec.dedup();
    ec
}

/// Canonical text form of an EC: ascending indices joined by commas.
pub fn canonical_ec_string(ec: &[TranscriptIndex]) -> String {
    ec.iter().join(",")
}

fn all_unmapped(records: &[Record]) -> bool {
    records.iter().all(|r| r.is_unmapped())
}

/// Concatenate the per-alignment ECs of one segment into forward/reverse
/// strand buckets. Unmapped records are skipped.
fn segment_buckets(
    index: &AnnotationIndex,
    contigs: &ContigNames,
    records: &[Record],
    config: &EcConfig,
) -> (Vec<TranscriptIndex>, Vec<TranscriptIndex>) {
    let mut forward = Vec::new();
    let mut reverse = Vec::new();
    for record in records {
        if record.is_unmapped() {
            continue;
        }
        let ec = if config.rapmap {
            match u32::try_from(record.tid()) {
                Ok(tid) => vec![tid],
                Err(_) => continue,
            }
        } else {
            match contigs.get(record.tid()) {
                Some(contig) => single_alignment_ec(index, contig, record, config.strict),
                None => continue,
            }
        };
        if record.is_reverse() {
            reverse.extend(ec);
        } else {
            forward.extend(ec);
        }
    }
    (forward, reverse)
}

fn sorted(mut values: Vec<TranscriptIndex>) -> Vec<TranscriptIndex> {
    values.sort_unstable();
    values
}

fn union_sorted(mut a: Vec<TranscriptIndex>, b: Vec<TranscriptIndex>) -> Vec<TranscriptIndex> {
    a.extend(b);
    a.sort_unstable();
    a
}

/// Merge-walk intersection of two ascending slices. Inputs may contain
/// duplicates; callers dedup the final EC once.
fn intersect_sorted(a: &[TranscriptIndex], b: &[TranscriptIndex]) -> Vec<TranscriptIndex> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
        }
    }
    out
}
