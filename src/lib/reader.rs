//! Parallel SAM/BAM ingestion
//!
//! Each input file is processed by a pool of worker threads that share the
//! frozen annotation index and the TCC matrix:
//!
//! 1. a preflight pass counts records and sniffs the `@PG` program id
//!    (a `rapmap` producer switches transcript numbering to alignment
//!    target ids);
//! 2. for paired data, a second pass decides whether mates share one QNAME
//!    or carry `/1`-`/2` style suffixes, which fixes the canonical read key;
//! 3. the record range is split into contiguous shards, one per worker.
//!    Workers open the file independently, skip to their shard, and align
//!    themselves to read-group boundaries: a worker landing mid-group skips
//!    that group, because its predecessor runs past its own shard end until
//!    the key changes.
//!
//! Workers stream one [`ShardReport`] each over a bounded channel; the
//! caller aggregates them and logs failures without aborting siblings.

use anyhow::Result;
use crossbeam::channel::bounded;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rayon::prelude::*;
use rust_htslib::bam::header::HeaderRecord;
use rust_htslib::bam::{self, Format, Header, Read, Record};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use crate::annotation::AnnotationIndex;
use crate::core::concurrency::build_worker_pool;
use crate::core::error::TccError;
use crate::core::fs::ensure_parent_dir;
use crate::matrix::TccMatrix;
use crate::resolver::{canonical_ec_string, read_ec, ContigNames, EcConfig, ReadGroup};

/// Per-run ingestion options shared by all input files.
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Worker threads per file.
    pub threads: usize,
    /// Treat reads as paired-end.
    pub paired: bool,
    /// Force rapmap transcript numbering regardless of the `@PG` header.
    pub rapmap: bool,
    /// Strict filtering, splice matching, and strand-aware pairing.
    pub strict: bool,
}

/// Outcome of one worker shard.
#[derive(Debug)]
pub struct ShardReport {
    pub shard: usize,
    pub groups: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub error: Option<String>,
}

/// Aggregated outcome of one input file.
#[derive(Debug, Default)]
pub struct FileSummary {
    pub groups: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub failed_shards: usize,
}

/// SAM sink for reads whose EC resolved to the empty set.
///
/// The header (`@HD` and `@SQ` lines of the first input plus a synthesised
/// `@PG` record carrying the invocation) is written when the sink is
/// created, before any worker starts; record appends from workers are
/// serialised through the internal mutex.
pub struct UnmatchedSink {
    writer: Mutex<bam::Writer>,
}

impl UnmatchedSink {
    pub fn create(path: &Path, first_input: &Path, invocation: &str) -> Result<Self> {
        let reader = open_alignment_reader(first_input)?;
        let text = Header::from_template(reader.header()).to_bytes();
        let text = String::from_utf8_lossy(&text);

        let mut header = Header::new();
        for line in text.lines() {
            let Some(rest) = line.strip_prefix('@') else {
                continue;
            };
            let mut fields = rest.split('\t');
            let tag = fields.next().unwrap_or("");
            if tag != "HD" && tag != "SQ" {
                continue;
            }
            let mut record = HeaderRecord::new(tag.as_bytes());
            for field in fields {
                if let Some((key, value)) = field.split_once(':') {
                    record.push_tag(key.as_bytes(), value);
                }
            }
            header.push_record(&record);
        }
        let mut program = HeaderRecord::new(b"PG");
        program.push_tag(b"ID", "bam2tcc");
        program.push_tag(b"PN", "bam2tcc");
        program.push_tag(b"VN", env!("CARGO_PKG_VERSION"));
        program.push_tag(b"CL", invocation);
        header.push_record(&program);

        ensure_parent_dir(path)?;
        let writer = bam::Writer::from_path(path, &header, Format::Sam)
            .map_err(|_| TccError::Open(path.display().to_string()))?;
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    /// Append every record of an unresolvable read group. Later inputs reuse
    /// the first input's target ordering.
    pub fn append_group(&self, group: &ReadGroup) -> Result<()> {
        let mut writer = self.writer.lock();
        for record in group.records() {
            writer.write(record)?;
        }
        Ok(())
    }
}

fn open_alignment_reader(path: &Path) -> Result<bam::Reader> {
    bam::Reader::from_path(path)
        .map_err(|_| TccError::Open(path.display().to_string()).into())
}

fn next_record(reader: &mut bam::Reader, record: &mut Record) -> Result<bool> {
    match reader.read(record) {
        Some(Ok(())) => Ok(true),
        Some(Err(err)) => Err(err.into()),
        None => Ok(false),
    }
}

/// Count the alignment records in a SAM/BAM file by streaming it once.
pub fn count_records(path: &Path) -> Result<u64> {
    let mut reader = open_alignment_reader(path)?;
    let mut record = Record::new();
    let mut count = 0u64;
    while next_record(&mut reader, &mut record)? {
        count += 1;
    }
    Ok(count)
}

/// The `ID:` value of the first `@PG` header line, if any.
pub fn program_id(path: &Path) -> Result<Option<String>> {
    let reader = open_alignment_reader(path)?;
    let text = Header::from_template(reader.header()).to_bytes();
    let text = String::from_utf8_lossy(&text);
    for line in text.lines() {
        if !line.starts_with("@PG") {
            continue;
        }
        let id = line
            .split('\t')
            .find_map(|field| field.strip_prefix("ID:"))
            .map(|id| id.to_owned());
        return Ok(id);
    }
    Ok(None)
}

/// One step of the QNAME-convention scan. `Some(all_same)` once decided.
fn convention_step(qname: &[u8], one_seen: &mut bool, two_seen: &mut bool) -> Option<bool> {
    if qname.len() < 2 {
        return Some(true);
    }
    if qname[qname.len() - 2].is_ascii_digit() {
        return Some(true);
    }
    match qname[qname.len() - 1] {
        b'1' => {
            if *one_seen && *two_seen {
                Some(false)
            } else {
                *one_seen = true;
                None
            }
        }
        b'2' => {
            *two_seen = true;
            None
        }
        _ => Some(true),
    }
}

/// Decide the mate naming convention from a stream of QNAMEs: suffix naming
/// (`…/1` then `…/2` then another `…/1`) yields `false`, anything
/// non-conforming falls back to the safe `true` (mates share the QNAME).
pub(crate) fn qname_convention<I, B>(names: I) -> bool
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut one_seen = false;
    let mut two_seen = false;
    for name in names {
        if let Some(all_same) = convention_step(name.as_ref(), &mut one_seen, &mut two_seen) {
            return all_same;
        }
    }
    true
}

fn detect_qname_convention(path: &Path) -> Result<bool> {
    let mut reader = open_alignment_reader(path)?;
    let mut record = Record::new();
    let mut one_seen = false;
    let mut two_seen = false;
    while next_record(&mut reader, &mut record)? {
        if let Some(all_same) = convention_step(record.qname(), &mut one_seen, &mut two_seen) {
            return Ok(all_same);
        }
    }
    Ok(true)
}

/// The canonical read key: the QNAME itself, or the QNAME minus its mate
/// suffix under suffix naming.
fn canonical_key(qname: &[u8], all_same: bool) -> &[u8] {
    if all_same || qname.len() < 2 {
        qname
    } else {
        &qname[..qname.len() - 2]
    }
}

/// Partition `[0, record_count)` into up to `workers` contiguous ranges.
fn shard_ranges(record_count: u64, workers: usize) -> Vec<(u64, u64)> {
    let workers = workers.max(1) as u64;
    let per_shard = record_count / workers;
    (0..workers)
        .map(|j| {
            let start = per_shard * j;
            let end = if j == workers - 1 {
                record_count
            } else {
                per_shard * (j + 1)
            };
            (start, end)
        })
        .filter(|(start, end)| end > start)
        .collect()
}

fn record_passes_filter(record: &Record, config: &EcConfig) -> bool {
    if config.strict {
        !(record.is_paired() && record.tid() != record.mtid())
            && !record.is_unmapped()
            && !(record.is_paired() && !record.is_proper_pair())
    } else {
        // Genome-BAM mode only rejects pairs whose mates aligned to
        // different targets.
        !(config.paired && record.tid() != record.mtid())
    }
}

/// Feed one input file into the matrix. Returns the per-file summary after
/// every worker has finished; worker failures are logged, not propagated.
pub fn process_file(
    path: &Path,
    sample_index: usize,
    index: &Arc<AnnotationIndex>,
    matrix: &Arc<TccMatrix>,
    sink: Option<&Arc<UnmatchedSink>>,
    options: &ReaderOptions,
) -> Result<FileSummary> {
    let record_count = count_records(path)?;

    let mut rapmap = options.rapmap;
    if let Some(program) = program_id(path)? {
        if program == "rapmap" {
            rapmap = true;
            info!("{} was produced by rapmap; using target-id numbering", path.display());
        }
    }

    let all_same = if options.paired {
        detect_qname_convention(path)?
    } else {
        true
    };

    let shards = shard_ranges(record_count, options.threads);
    info!(
        "Reading {} ({} records across {} shard(s))",
        path.display(),
        record_count,
        shards.len()
    );

    let config = EcConfig {
        paired: options.paired,
        rapmap,
        strict: options.strict,
    };
    let pool = build_worker_pool(options.threads)?;
    let (sender, receiver) = bounded::<ShardReport>(shards.len().max(1));

    let path = path.to_path_buf();
    let index = Arc::clone(index);
    let matrix = Arc::clone(matrix);
    let sink = sink.map(Arc::clone);
    let scheduler = thread::spawn(move || {
        pool.install(move || {
            shards
                .into_par_iter()
                .enumerate()
                .for_each_with(sender, |sender, (shard_idx, (start, end))| {
                    let report = match process_shard(
                        &path,
                        start,
                        end,
                        sample_index,
                        &index,
                        &matrix,
                        sink.as_deref(),
                        &config,
                        all_same,
                    ) {
                        Ok((groups, matched, unmatched)) => ShardReport {
                            shard: shard_idx,
                            groups,
                            matched,
                            unmatched,
                            error: None,
                        },
                        Err(err) => ShardReport {
                            shard: shard_idx,
                            groups: 0,
                            matched: 0,
                            unmatched: 0,
                            error: Some(format!("{:#}", err)),
                        },
                    };
                    if sender.send(report).is_err() {
                        warn!("Shard report channel closed early");
                    }
                });
        });
    });

    let mut summary = FileSummary::default();
    for report in receiver {
        match report.error {
            Some(message) => {
                warn!(
                    "{}",
                    TccError::Worker(format!("shard {}: {}", report.shard, message))
                );
                summary.failed_shards += 1;
            }
            None => {
                debug!(
                    "shard {} finished: {} groups, {} unmatched",
                    report.shard, report.groups, report.unmatched
                );
                summary.groups += report.groups;
                summary.matched += report.matched;
                summary.unmatched += report.unmatched;
            }
        }
    }
    // Joining releases the workers' matrix and sink handles before the
    // caller moves on to the next file or starts writing output.
    scheduler
        .join()
        .map_err(|_| TccError::Worker("shard scheduler thread panicked".to_owned()))?;
    Ok(summary)
}

/// Worker body: consume the read groups whose first record falls inside
/// `[start, end)`, resolving each to an EC and updating the matrix.
#[allow(clippy::too_many_arguments)]
fn process_shard(
    path: &Path,
    start: u64,
    end: u64,
    sample_index: usize,
    index: &AnnotationIndex,
    matrix: &TccMatrix,
    sink: Option<&UnmatchedSink>,
    config: &EcConfig,
    all_same: bool,
) -> Result<(u64, u64, u64)> {
    let mut reader = open_alignment_reader(path)?;
    let contigs = ContigNames::from_header(reader.header());
    let mut record = Record::new();
    let mut consumed = 0u64;
    let (mut groups, mut matched, mut unmatched) = (0u64, 0u64, 0u64);

    if start == 0 {
        if !next_record(&mut reader, &mut record)? {
            return Ok((groups, matched, unmatched));
        }
        consumed = 1;
    } else {
        while consumed < start {
            if !next_record(&mut reader, &mut record)? {
                return Ok((groups, matched, unmatched));
            }
            consumed += 1;
        }
        // `record` is the last record of the previous shard; its read group
        // belongs to the predecessor, so advance past every record sharing
        // its key.
        let boundary = canonical_key(record.qname(), all_same).to_vec();
        loop {
            if !next_record(&mut reader, &mut record)? {
                return Ok((groups, matched, unmatched));
            }
            consumed += 1;
            if canonical_key(record.qname(), all_same) != boundary.as_slice() {
                break;
            }
        }
    }

    let mut group = ReadGroup::default();
    let mut exhausted = false;
    // `record` holds the first record of the next group, at 0-based index
    // `consumed - 1`; the group is ours while that index is below `end`.
    while !exhausted && consumed <= end {
        let key = canonical_key(record.qname(), all_same).to_vec();
        loop {
            if record_passes_filter(&record, config) {
                group.push(record.clone());
            }
            if !next_record(&mut reader, &mut record)? {
                exhausted = true;
                break;
            }
            consumed += 1;
            if canonical_key(record.qname(), all_same) != key.as_slice() {
                break;
            }
        }

        let ec = read_ec(index, &contigs, &group, config);
        groups += 1;
        if ec.is_empty() {
            unmatched += 1;
            if let Some(sink) = sink {
                sink.append_group(&group)?;
            }
        } else {
            matrix.increment(&canonical_ec_string(&ec), sample_index);
            matched += 1;
        }
        group.clear();
    }

    Ok((groups, matched, unmatched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write as _;
    use std::path::PathBuf;

    #[test]
    fn shard_ranges_cover_all_records() {
        assert_eq!(shard_ranges(10, 1), vec![(0, 10)]);
        assert_eq!(shard_ranges(10, 3), vec![(0, 3), (3, 6), (6, 10)]);
        assert_eq!(shard_ranges(2, 4), vec![(0, 2)]);
        assert!(shard_ranges(0, 4).is_empty());
    }

    #[test]
    fn canonical_key_strips_suffix_when_differentiated() {
        assert_eq!(canonical_key(b"read7/1", true), b"read7/1");
        assert_eq!(canonical_key(b"read7/1", false), b"read7");
        assert_eq!(canonical_key(b"r", false), b"r");
    }

    #[test]
    fn qname_convention_detection() {
        // /1, /2, /1 again: suffix-differentiated naming.
        assert!(!qname_convention([b"x/1".as_ref(), b"x/2", b"y/1"]));
        // Same QNAME for both mates: stays on the safe default.
        assert!(qname_convention([b"pair1".as_ref(), b"pair1", b"pair2"]));
        // Digit before the suffix position is non-conforming.
        assert!(qname_convention([b"r11".as_ref(), b"r12"]));
        assert!(qname_convention(Vec::<&[u8]>::new()));
    }

    fn write_s1_inputs(dir: &tempfile::TempDir) -> (PathBuf, PathBuf) {
        let gtf_path = dir.path().join("anno.gtf");
        let mut gtf = fs::File::create(&gtf_path).unwrap();
        writeln!(
            gtf,
            "chr1\thavana\texon\t100\t200\t.\t+\t.\tgene_id \"G1\"; transcript_id \"ENST1\";"
        )
        .unwrap();
        writeln!(
            gtf,
            "chr1\thavana\texon\t150\t250\t.\t+\t.\tgene_id \"G1\"; transcript_id \"ENST2\";"
        )
        .unwrap();

        let sam_path = dir.path().join("reads.sam");
        let mut sam = fs::File::create(&sam_path).unwrap();
        writeln!(sam, "@HD\tVN:1.6\tSO:unsorted").unwrap();
        writeln!(sam, "@SQ\tSN:chr1\tLN:1000").unwrap();
        writeln!(sam, "r1\t0\tchr1\t160\t60\t30M\t*\t0\t0\t*\t*").unwrap();
        (gtf_path, sam_path)
    }

    fn options(threads: usize, paired: bool) -> ReaderOptions {
        ReaderOptions {
            threads,
            paired,
            rapmap: false,
            strict: false,
        }
    }

    #[test]
    fn single_end_read_lands_in_shared_ec() {
        let dir = tempfile::tempdir().unwrap();
        let (gtf, sam) = write_s1_inputs(&dir);

        let index = Arc::new(AnnotationIndex::from_files(&[gtf], &[]).unwrap());
        let matrix = Arc::new(TccMatrix::new(1));
        let summary =
            process_file(&sam, 0, &index, &matrix, None, &options(1, false)).unwrap();

        assert_eq!(summary.groups, 1);
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.unmatched, 0);
        assert_eq!(matrix.len(), 1);

        let stem = dir.path().join("out").to_str().unwrap().to_owned();
        matrix.write_dense(&stem).unwrap();
        assert_eq!(
            fs::read_to_string(format!("{}.ec", stem)).unwrap(),
            "0\t0,1\n"
        );
        assert_eq!(
            fs::read_to_string(format!("{}.tsv", stem)).unwrap(),
            "0\t1\n"
        );
    }

    #[test]
    fn sharded_workers_count_each_group_once() {
        let dir = tempfile::tempdir().unwrap();
        let (gtf, _) = write_s1_inputs(&dir);

        let sam_path = dir.path().join("many.sam");
        let mut sam = fs::File::create(&sam_path).unwrap();
        writeln!(sam, "@HD\tVN:1.6\tSO:unsorted").unwrap();
        writeln!(sam, "@SQ\tSN:chr1\tLN:1000").unwrap();
        for i in 0..7 {
            // Two alignments per read: the group spans shard boundaries.
            writeln!(sam, "r{}\t0\tchr1\t160\t60\t30M\t*\t0\t0\t*\t*", i).unwrap();
            writeln!(sam, "r{}\t256\tchr1\t165\t60\t30M\t*\t0\t0\t*\t*", i).unwrap();
        }
        drop(sam);

        let index = Arc::new(AnnotationIndex::from_files(&[gtf], &[]).unwrap());
        let matrix = Arc::new(TccMatrix::new(1));
        let summary =
            process_file(&sam_path, 0, &index, &matrix, None, &options(3, false)).unwrap();

        assert_eq!(summary.groups, 7);
        assert_eq!(summary.failed_shards, 0);
        assert_eq!(matrix.total_count(), 7);
    }

    #[test]
    fn orphan_pair_goes_to_unmatched_sink() {
        let dir = tempfile::tempdir().unwrap();
        let (gtf, _) = write_s1_inputs(&dir);

        let sam_path = dir.path().join("pairs.sam");
        let mut sam = fs::File::create(&sam_path).unwrap();
        writeln!(sam, "@HD\tVN:1.6\tSO:unsorted").unwrap();
        writeln!(sam, "@SQ\tSN:chr1\tLN:1000").unwrap();
        // 73 = paired + mate unmapped + first segment: an orphan.
        writeln!(sam, "p1\t73\tchr1\t160\t60\t30M\t=\t160\t0\t*\t*").unwrap();
        drop(sam);

        let sink_path = dir.path().join("unmatched.sam");
        let sink = Arc::new(
            UnmatchedSink::create(&sink_path, &sam_path, "bam2tcc -test").unwrap(),
        );

        let index = Arc::new(AnnotationIndex::from_files(&[gtf], &[]).unwrap());
        let matrix = Arc::new(TccMatrix::new(1));
        let summary = process_file(
            &sam_path,
            0,
            &index,
            &matrix,
            Some(&sink),
            &options(1, true),
        )
        .unwrap();

        assert_eq!(summary.unmatched, 1);
        assert_eq!(summary.matched, 0);
        assert!(matrix.is_empty());

        drop(sink);
        let written = fs::read_to_string(&sink_path).unwrap();
        assert!(written.contains("@SQ\tSN:chr1"));
        assert!(written.contains("@PG"));
        assert!(written.lines().any(|l| l.starts_with("p1\t")));
    }

    #[test]
    fn preflight_counts_and_program_id() {
        let dir = tempfile::tempdir().unwrap();
        let sam_path = dir.path().join("pg.sam");
        let mut sam = fs::File::create(&sam_path).unwrap();
        writeln!(sam, "@HD\tVN:1.6").unwrap();
        writeln!(sam, "@SQ\tSN:chr1\tLN:1000").unwrap();
        writeln!(sam, "@PG\tID:rapmap\tPN:rapmap").unwrap();
        writeln!(sam, "r1\t0\tchr1\t1\t60\t10M\t*\t0\t0\t*\t*").unwrap();
        writeln!(sam, "r2\t0\tchr1\t5\t60\t10M\t*\t0\t0\t*\t*").unwrap();
        drop(sam);

        assert_eq!(count_records(&sam_path).unwrap(), 2);
        assert_eq!(program_id(&sam_path).unwrap().as_deref(), Some("rapmap"));
    }
}
