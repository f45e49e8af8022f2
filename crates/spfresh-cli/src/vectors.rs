//! Vector file I/O (§6 "Vector file formats"). `--db-vectors` and
//! `--query-vectors` are always the "Raw" format the flag table
//! describes: `count * dim * sizeof(T)` bytes, no header — `dim` and
//! `T` come from `--dim`/`--value-type`, `count` from the file length
//! (optionally capped by the caller).

use spfresh_core::{SpfreshError, ValueType};
use std::path::Path;

pub fn read_raw(
    path: &Path,
    dim: usize,
    value_type: ValueType,
    max_count: Option<usize>,
) -> Result<Vec<Vec<f32>>, SpfreshError> {
    let bytes = std::fs::read(path)
        .map_err(|e| SpfreshError::Corrupted(format!("reading {}: {e}", path.display())))?;
    let stride = dim * value_type.element_size();
    if stride == 0 {
        return Ok(Vec::new());
    }
    let available = bytes.len() / stride;
    let count = max_count.map_or(available, |c| c.min(available));
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let chunk = &bytes[i * stride..(i + 1) * stride];
        out.push(value_type.decode(chunk, dim));
    }
    Ok(out)
}

/// Deterministic pseudo-random batch, used when no `--db-vectors`/
/// `--query-vectors` file is given (`--seed`, default 42). Each batch
/// gets its own slice of the stream so repeated runs with the same
/// seed build the same index.
pub fn generate(dim: usize, count: usize, seed: u64) -> Vec<Vec<f32>> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}
