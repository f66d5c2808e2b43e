//! CLI command that drives the whole pipeline: annotation index, parallel
//! SAM/BAM ingestion, and matrix output.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use log::{info, warn};
use structopt::StructOpt;

use bam2tcc_lib::annotation::AnnotationIndex;
use bam2tcc_lib::core::error::TccError;
use bam2tcc_lib::core::fs::{ensure_parent_dir, strip_alignment_extension, test_open};
use bam2tcc_lib::ec_order;
use bam2tcc_lib::matrix::TccMatrix;
use bam2tcc_lib::reader::{self, ReaderOptions, UnmatchedSink};

/// Arguments for bam2tcc
#[derive(Debug, StructOpt)]
#[structopt(
    name = "bam2tcc",
    about = "Convert aligned SAM/BAM reads into a transcript-compatibility-count matrix"
)]
pub struct TccArgs {
    /// Comma-separated GTF/GFF annotation files (optional with --rapmap)
    #[structopt(short = "g", long = "gtf")]
    pub gtf: Option<String>,

    /// Comma-separated SAM/BAM files of aligned reads, one sample each
    #[structopt(short = "S", long = "sam")]
    pub sam: String,

    /// Output stem; writes <stem>.ec, <stem>.tsv and <stem>.cells
    #[structopt(short = "o", long = "output", default_value = "matrix")]
    pub output: String,

    /// Number of worker threads per input file
    #[structopt(short = "p", long = "threads", default_value = "1")]
    pub threads: usize,

    /// Suppress status updates and most warnings
    #[structopt(short = "q", long = "quiet")]
    pub quiet: bool,

    /// Comma-separated FASTA transcriptomes; renumbers transcripts to match
    /// what kallisto would assign for the same files
    #[structopt(short = "t", long = "transcriptome")]
    pub transcriptome: Option<String>,

    /// Order output rows to match an existing EC file
    #[structopt(short = "e", long = "ec", parse(from_os_str))]
    pub ec: Option<PathBuf>,

    /// Write a dense matrix (one column per sample) instead of sparse triples
    #[structopt(long = "full-matrix")]
    pub full_matrix: bool,

    /// Write reads with an empty equivalence class to this SAM file
    #[structopt(short = "u", long = "unmatched", parse(from_os_str))]
    pub unmatched: Option<PathBuf>,

    /// Treat reads as single-end (default: paired)
    #[structopt(short = "U", long = "unpaired")]
    pub unpaired: bool,

    /// Force rapmap mode: equivalence classes come from alignment target ids
    #[structopt(short = "r", long = "rapmap")]
    pub rapmap: bool,

    /// Strict mode: exact splice-site matching, strand-aware pairing, and
    /// proper-pair filtering (default matches kallisto's genome BAMs)
    #[structopt(long = "strict")]
    pub strict: bool,
}

fn parse_csv(input: &str) -> Vec<PathBuf> {
    input
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Run the pipeline end to end. Any I/O failure short-circuits with the
/// offending path in the error chain.
pub fn run_tcc(args: TccArgs) -> Result<()> {
    let started = Instant::now();

    let gtf_files = parse_csv(args.gtf.as_deref().unwrap_or(""));
    let sam_files = parse_csv(&args.sam);
    let transcriptome_files = parse_csv(args.transcriptome.as_deref().unwrap_or(""));

    if sam_files.is_empty() {
        return Err(anyhow!("at least one SAM/BAM input is required (-S)"));
    }
    if gtf_files.is_empty() && !args.rapmap {
        return Err(anyhow!("-g/--gtf is required unless --rapmap is set"));
    }

    // Fail on unreadable inputs before any real work starts.
    for path in gtf_files
        .iter()
        .chain(&sam_files)
        .chain(&transcriptome_files)
        .chain(&args.ec)
    {
        test_open(path)?;
    }

    let index = if gtf_files.is_empty() {
        AnnotationIndex::empty()
    } else {
        info!("Reading {} GTF file(s)...", gtf_files.len());
        let index = AnnotationIndex::from_files(&gtf_files, &transcriptome_files)?;
        info!(
            "Indexed {} transcripts across {} chromosomes",
            index.num_transcripts(),
            index.num_chromosomes()
        );
        index
    };
    let index = Arc::new(index);

    let matrix = Arc::new(TccMatrix::new(sam_files.len()));
    let sink = match &args.unmatched {
        Some(path) => {
            let invocation = std::env::args().collect::<Vec<_>>().join(" ");
            Some(Arc::new(UnmatchedSink::create(
                path,
                &sam_files[0],
                &invocation,
            )?))
        }
        None => None,
    };

    let options = ReaderOptions {
        threads: args.threads,
        paired: !args.unpaired,
        rapmap: args.rapmap,
        strict: args.strict,
    };

    let mut unmatched_total = 0u64;
    for (sample_index, path) in sam_files.iter().enumerate() {
        let summary =
            reader::process_file(path, sample_index, &index, &matrix, sink.as_ref(), &options)?;
        if summary.failed_shards > 0 {
            warn!(
                "{}: {} shard(s) failed; counts for this sample may be incomplete",
                path.display(),
                summary.failed_shards
            );
        }
        info!(
            "{}: {} read groups, {} matched, {} unmatched",
            path.display(),
            summary.groups,
            summary.matched,
            summary.unmatched
        );
        unmatched_total += summary.unmatched;
    }
    // Flush the unmatched SAM before the matrix files are finalised.
    drop(sink);

    write_matrix(&args, &matrix)?;
    write_cells(&args.output, &sam_files)?;

    info!(
        "{} equivalence classes, {} counted reads, {} unmatched reads in {:.2?}",
        matrix.len(),
        matrix.total_count(),
        unmatched_total,
        started.elapsed()
    );
    Ok(())
}

fn write_matrix(args: &TccArgs, matrix: &TccMatrix) -> Result<()> {
    match &args.ec {
        Some(ec_path) => {
            let (order, order_set) = ec_order::load(ec_path)?;
            if args.full_matrix {
                matrix.write_dense_ordered(&args.output, &order, &order_set)
            } else {
                matrix.write_sparse_ordered(&args.output, &order, &order_set)
            }
        }
        None => {
            if args.full_matrix {
                matrix.write_dense(&args.output)
            } else {
                matrix.write_sparse(&args.output)
            }
        }
    }
}

/// Emit `<stem>.cells`: the input paths in order, minus their alignment
/// file extension.
fn write_cells(stem: &str, sam_files: &[PathBuf]) -> Result<()> {
    let path = format!("{}.cells", stem);
    ensure_parent_dir(&path)?;
    let file = File::create(&path).map_err(|_| TccError::Open(path.clone()))?;
    let mut out = BufWriter::new(file);
    for sam in sam_files {
        writeln!(out, "{}", strip_alignment_extension(&sam.to_string_lossy()))?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_arguments() {
        let args =
            TccArgs::from_iter_safe(&["bam2tcc", "-g", "a.gtf,b.gtf", "-S", "x.bam"]).unwrap();
        assert_eq!(args.gtf.as_deref(), Some("a.gtf,b.gtf"));
        assert_eq!(args.sam, "x.bam");
        assert_eq!(args.output, "matrix");
        assert_eq!(args.threads, 1);
        assert!(!args.full_matrix);
        assert!(!args.unpaired);
        assert!(!args.strict);
    }

    #[test]
    fn csv_lists_split_and_trim() {
        assert_eq!(
            parse_csv("a.gtf, b.gtf,"),
            vec![PathBuf::from("a.gtf"), PathBuf::from("b.gtf")]
        );
        assert!(parse_csv("").is_empty());
    }

    #[test]
    fn missing_sam_input_is_rejected() {
        assert!(TccArgs::from_iter_safe(&["bam2tcc", "-g", "a.gtf"]).is_err());
    }

    #[test]
    fn rapmap_mode_allows_missing_gtf() {
        let args = TccArgs::from_iter_safe(&["bam2tcc", "-S", "x.bam", "--rapmap"]).unwrap();
        assert!(args.rapmap);
        assert!(args.gtf.is_none());
    }
}
