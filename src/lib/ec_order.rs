//! External EC ordering
//!
//! kallisto (and compatible tools) emit an `.ec` file of
//! `row_id<TAB>ec_string` lines. Loading one yields the EC strings in file
//! order plus a membership set; the matrix emitters use both to reproduce
//! the external row ordering. The external row ids themselves are ignored:
//! our row id is the position in the loaded order.

use anyhow::Result;
use rustc_hash::FxHashSet;
use std::io::BufRead;
use std::path::Path;

use crate::core::error::TccError;
use crate::core::fs::open_text_reader;

/// Load an external EC file into `(order, order_set)`.
pub fn load(path: &Path) -> Result<(Vec<String>, FxHashSet<String>)> {
    let reader = open_text_reader(path)?;
    let mut order = Vec::new();
    let mut order_set = FxHashSet::default();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?.to_lowercase();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let _row_id = fields.next();
        let ec = fields.next().ok_or_else(|| {
            TccError::Parse(format!(
                "{}:{}: expected row_id<TAB>ec_string",
                path.display(),
                line_no + 1
            ))
        })?;
        order.push(ec.to_owned());
        order_set.insert(ec.to_owned());
    }
    Ok((order, order_set))
}
