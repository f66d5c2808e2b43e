//! Transcript-compatibility-count matrix
//!
//! A concurrent map from canonical EC strings to per-sample counters.
//! Contention is kept low by sharding on a hash of the EC string and giving
//! every shard its own mutex; there is deliberately no whole-map lock on the
//! increment path. Rows are created on first increment and live until the
//! process exits.

use anyhow::Result;
use itertools::Itertools;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::core::error::TccError;
use crate::core::fs::ensure_parent_dir;

const SHARD_COUNT: usize = 64;

/// Sharded EC-string → per-sample counter map.
pub struct TccMatrix {
    num_samples: usize,
    shards: Vec<Mutex<FxHashMap<String, Vec<u64>>>>,
}

impl TccMatrix {
    pub fn new(num_samples: usize) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(FxHashMap::default()))
            .collect();
        Self {
            num_samples,
            shards,
        }
    }

    fn shard_index(ec: &str) -> usize {
        let mut hasher = FxHasher::default();
        ec.hash(&mut hasher);
        hasher.finish() as usize % SHARD_COUNT
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Add one to `(ec, sample)`, inserting a zeroed row on first sight.
    /// Only the owning shard is locked, so concurrent workers on different
    /// ECs rarely contend.
    pub fn increment(&self, ec: &str, sample: usize) {
        debug_assert!(sample < self.num_samples);
        let mut shard = self.shards[Self::shard_index(ec)].lock();
        match shard.get_mut(ec) {
            Some(row) => row[sample] += 1,
            None => {
                let mut row = vec![0u64; self.num_samples];
                row[sample] = 1;
                shard.insert(ec.to_owned(), row);
            }
        }
    }

    /// Number of distinct ECs seen so far.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of every counter in the matrix.
    pub fn total_count(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.lock().values().flatten().sum::<u64>())
            .sum()
    }

    /// Snapshot of all rows in emitter enumeration order (shards in index
    /// order, rows in shard iteration order).
    fn rows(&self) -> Vec<(String, Vec<u64>)> {
        let mut rows = Vec::with_capacity(self.len());
        for shard in &self.shards {
            let shard = shard.lock();
            rows.extend(shard.iter().map(|(ec, counts)| (ec.clone(), counts.clone())));
        }
        rows
    }

    /// Rows rearranged to follow an external EC ordering: ordered ECs first
    /// (all-zero rows for ECs the matrix never saw), then the remaining
    /// matrix rows in enumeration order.
    fn rows_in_order(&self, order: &[String], order_set: &FxHashSet<String>) -> Vec<(String, Vec<u64>)> {
        let rows = self.rows();
        let by_ec: FxHashMap<&str, &Vec<u64>> =
            rows.iter().map(|(ec, counts)| (ec.as_str(), counts)).collect();

        let mut out = Vec::with_capacity(order.len() + rows.len());
        for ec in order {
            let counts = by_ec
                .get(ec.as_str())
                .map(|counts| (*counts).clone())
                .unwrap_or_else(|| vec![0u64; self.num_samples]);
            out.push((ec.clone(), counts));
        }
        for (ec, counts) in &rows {
            if !order_set.contains(ec) {
                out.push((ec.clone(), counts.clone()));
            }
        }
        out
    }

    /// Emit `<stem>.ec` and a dense `<stem>.tsv` (one column per sample).
    pub fn write_dense(&self, stem: &str) -> Result<()> {
        emit(&self.rows(), stem, Layout::Dense)
    }

    /// Emit `<stem>.ec` and a sparse `<stem>.tsv` of non-zero
    /// `row_id<TAB>sample<TAB>count` triples.
    pub fn write_sparse(&self, stem: &str) -> Result<()> {
        emit(&self.rows(), stem, Layout::Sparse)
    }

    pub fn write_dense_ordered(
        &self,
        stem: &str,
        order: &[String],
        order_set: &FxHashSet<String>,
    ) -> Result<()> {
        emit(&self.rows_in_order(order, order_set), stem, Layout::Dense)
    }

    pub fn write_sparse_ordered(
        &self,
        stem: &str,
        order: &[String],
        order_set: &FxHashSet<String>,
    ) -> Result<()> {
        emit(&self.rows_in_order(order, order_set), stem, Layout::Sparse)
    }
}

#[derive(Clone, Copy)]
enum Layout {
    Dense,
    Sparse,
}

fn create_output(path: PathBuf) -> Result<BufWriter<File>> {
    ensure_parent_dir(&path)?;
    let file =
        File::create(&path).map_err(|_| TccError::Open(path.display().to_string()))?;
    Ok(BufWriter::new(file))
}

fn emit(rows: &[(String, Vec<u64>)], stem: &str, layout: Layout) -> Result<()> {
    let mut ec_out = create_output(PathBuf::from(format!("{}.ec", stem)))?;
    let mut tsv_out = create_output(PathBuf::from(format!("{}.tsv", stem)))?;

    for (row_id, (ec, counts)) in rows.iter().enumerate() {
        writeln!(ec_out, "{}\t{}", row_id, ec)?;
        match layout {
            Layout::Dense => {
                writeln!(tsv_out, "{}\t{}", row_id, counts.iter().join("\t"))?;
            }
            Layout::Sparse => {
                for (sample, count) in counts.iter().enumerate() {
                    if *count != 0 {
                        writeln!(tsv_out, "{}\t{}\t{}", row_id, sample, count)?;
                    }
                }
            }
        }
    }
    ec_out.flush()?;
    tsv_out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::thread;

    fn stem(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_str().unwrap().to_owned()
    }

    #[test]
    fn increment_creates_and_accumulates_rows() {
        let matrix = TccMatrix::new(3);
        matrix.increment("0,1", 0);
        matrix.increment("0,1", 0);
        matrix.increment("0,1", 2);
        matrix.increment("4", 1);
        assert_eq!(matrix.len(), 2);
        assert_eq!(matrix.total_count(), 4);
    }

    #[test]
    fn concurrent_increments_are_exact() {
        let matrix = Arc::new(TccMatrix::new(2));
        let ecs = ["0", "0,1", "1,2,3", "7", "2,9"];
        let mut handles = Vec::new();
        for worker in 0..8 {
            let matrix = Arc::clone(&matrix);
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    let ec = ecs[(worker + i) % ecs.len()];
                    matrix.increment(ec, i % 2);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(matrix.len(), 5);
        assert_eq!(matrix.total_count(), 8 * 1000);
    }

    #[test]
    fn sparse_emits_nonzero_triples_only() {
        let dir = tempfile::tempdir().unwrap();
        let matrix = TccMatrix::new(3);
        for _ in 0..3 {
            matrix.increment("0,1", 0);
        }
        for _ in 0..5 {
            matrix.increment("0,1", 2);
        }
        let stem = stem(&dir, "out");
        matrix.write_sparse(&stem).unwrap();

        let tsv = fs::read_to_string(format!("{}.tsv", stem)).unwrap();
        assert_eq!(tsv, "0\t0\t3\n0\t2\t5\n");
        let ec = fs::read_to_string(format!("{}.ec", stem)).unwrap();
        assert_eq!(ec, "0\t0,1\n");
    }

    #[test]
    fn dense_emits_every_sample_column() {
        let dir = tempfile::tempdir().unwrap();
        let matrix = TccMatrix::new(3);
        matrix.increment("2,5", 1);
        let stem = stem(&dir, "dense");
        matrix.write_dense(&stem).unwrap();

        let tsv = fs::read_to_string(format!("{}.tsv", stem)).unwrap();
        assert_eq!(tsv, "0\t0\t1\t0\n");
    }

    #[test]
    fn ordered_emitters_follow_external_order() {
        let dir = tempfile::tempdir().unwrap();
        let matrix = TccMatrix::new(1);
        matrix.increment("0,1", 0);
        matrix.increment("5", 0);

        let order = vec!["9,10".to_owned(), "0,1".to_owned()];
        let order_set: FxHashSet<String> = order.iter().cloned().collect();
        let stem = stem(&dir, "ordered");
        matrix.write_dense_ordered(&stem, &order, &order_set).unwrap();

        let ec = fs::read_to_string(format!("{}.ec", stem)).unwrap();
        let lines: Vec<&str> = ec.lines().collect();
        // External order first (including the EC we never saw), then the
        // leftover matrix row.
        assert_eq!(lines[0], "0\t9,10");
        assert_eq!(lines[1], "1\t0,1");
        assert_eq!(lines[2], "2\t5");

        let tsv = fs::read_to_string(format!("{}.tsv", stem)).unwrap();
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(lines[0], "0\t0");
        assert_eq!(lines[1], "1\t1");
        assert_eq!(lines[2], "2\t1");
    }

    #[test]
    fn identical_ec_strings_share_a_row() {
        let matrix = TccMatrix::new(2);
        matrix.increment("1,2,3", 0);
        matrix.increment("1,2,3", 1);
        assert_eq!(matrix.len(), 1);
    }
}
