use anyhow::Result;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::core::error::TccError;

/// Create the directories leading up to an output file.
///
/// The output stem (and the unmatched-sink path) may point into a directory
/// that does not exist yet; `Path::parent` yields an empty path for bare
/// file names, which `create_dir_all` rejects, so that case is skipped.
pub fn ensure_parent_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    match path.as_ref().parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Open a text input (GTF/GFF, FASTA, or EC file) for buffered line
/// reading, decompressing gzip-suffixed files transparently. Failure to
/// open is reported with the offending path.
pub fn open_text_reader<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|_| TccError::Open(path.display().to_string()))?;
    let gzipped = path
        .extension()
        .map_or(false, |ext| ext == "gz" || ext == "gzip");
    let reader: Box<dyn BufRead> = if gzipped {
        Box::new(BufReader::with_capacity(256 * 1024, GzDecoder::new(file)))
    } else {
        Box::new(BufReader::with_capacity(256 * 1024, file))
    };
    Ok(reader)
}

/// Check that a file can be opened for reading without consuming it.
pub fn test_open<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    File::open(path).map_err(|_| TccError::Open(path.display().to_string()))?;
    Ok(())
}

/// Strip a trailing `.sam`/`.bam` extension from an input path string, as
/// used for the `.cells` manifest.
pub fn strip_alignment_extension(path: &str) -> &str {
    path.strip_suffix(".sam")
        .or_else(|| path.strip_suffix(".bam"))
        .unwrap_or(path)
}
