//! bam2tcc - Transcript-Compatibility-Count matrices from aligned reads
//!
//! bam2tcc converts SAM/BAM files of aligned reads into the
//! transcript-compatibility-count (TCC) matrix that pseudo-alignment
//! pipelines consume: for every read (or read pair) it derives the set of
//! transcripts the alignments are compatible with from a GTF/GFF
//! annotation, and counts reads per equivalence class and input sample.
//! Transcript numbering can be reconciled with a kallisto transcriptome so
//! the output plugs into an existing kallisto workflow.
//!
//! # Usage
//!
//! ```bash
//! # Sparse TCC matrix from two samples
//! bam2tcc -g annotation.gtf -S sample1.bam,sample2.bam -o counts
//!
//! # kallisto-compatible numbering and row order, eight workers per file
//! bam2tcc -g annotation.gtf -t transcripts.fa -e kallisto.ec \
//!         -S sample1.bam -p 8 -o counts
//!
//! # Keep reads that match nothing for inspection
//! bam2tcc -g annotation.gtf -S sample.bam -u unmatched.sam
//! ```

extern crate bam2tcc_lib;

pub mod commands;

use commands::TccArgs;
use env_logger::Env;
use log::*;
use std::io;
use structopt::StructOpt;

fn main() {
    let args = TccArgs::from_args();
    let default_level = if args.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    if let Err(err) = commands::run_tcc(args) {
        // A consumer closing our stdout/stderr pipe is a clean exit, not a
        // failure worth reporting.
        let broken_pipe = err
            .root_cause()
            .downcast_ref::<io::Error>()
            .map_or(false, |io_err| io_err.kind() == io::ErrorKind::BrokenPipe);
        if broken_pipe {
            std::process::exit(0);
        }
        error!("{:#}", err);
        std::process::exit(1);
    }
}
