use anyhow::Result;
use log::warn;

use crate::core::error::TccError;

/// Build the worker pool for one input file.
///
/// Every file gets its own pool of exactly the requested size: shard counts
/// are derived from it, so silently clamping would change how the record
/// range is partitioned. Oversubscribing the machine is allowed (workers
/// spend part of their time in file I/O) but worth a warning.
pub fn build_worker_pool(threads: usize) -> Result<rayon::ThreadPool> {
    if threads == 0 {
        return Err(TccError::InvalidInput("worker thread count must be at least 1".to_owned()).into());
    }
    let available = num_cpus::get();
    if threads > available {
        warn!(
            "{} worker threads requested but only {} CPUs available",
            threads, available
        );
    }
    let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_threads() {
        assert!(build_worker_pool(0).is_err());
        assert_eq!(build_worker_pool(2).unwrap().current_num_threads(), 2);
    }
}
