//! Layout and compression selection for a buffered block of pairs.
//!
//! The batch is fully in memory when a block commits, so the selector can
//! compute the exact encoded size of each candidate rather than estimate
//! it: per-field sums under every compression mode for the stream layouts,
//! and the fixed-width column sizes for Indexed-Column. Row pays a
//! configurable size penalty (`rate_list`) for its worse seek behavior.

use itertools::Itertools;

use crate::encoding;
use crate::layout::{encoded_len, Compression, Layout, Signature};

const MODES: [Compression; 3] = [Compression::None, Compression::Var1, Compression::Var2];
const BLOCK_COUNT_FIELD: u64 = 4;
const INDEXED_HEADER: u64 = 2 * BLOCK_COUNT_FIELD + 2;

fn stream_cost(values: &[u64], mode: Compression) -> u64 {
    values.iter().map(|&v| encoded_len(v, mode)).sum()
}

/// Cheapest compression mode for a value stream and its total bytes.
fn best_mode(values: &[u64]) -> (Compression, u64) {
    MODES
        .iter()
        .map(|&m| (m, stream_cost(values, m)))
        .min_by_key(|&(_, cost)| cost)
        .expect("MODES is non-empty")
}

/// Field stream for a key column under delta encoding: first value
/// absolute, the rest gaps from the previous value.
fn deltas(keys: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(keys.len());
    let mut prev = None;
    for &k in keys {
        out.push(match prev {
            Some(p) => k - p,
            None => k,
        });
        prev = Some(k);
    }
    out
}

/// key2 field stream as the grouped layouts encode it: absolute at each
/// group start, gap + 1 from the previous value inside a group.
fn group_second_fields(key1s: &[u64], key2s: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(key2s.len());
    for i in 0..key2s.len() {
        if i > 0 && key1s[i] == key1s[i - 1] {
            out.push(key2s[i] - key2s[i - 1] + 1);
        } else {
            out.push(key2s[i]);
        }
    }
    out
}

/// Best (delta flag, mode, bytes) choice for a key1 field stream.
fn best_first_encoding(abs: &[u64]) -> (bool, Compression, u64) {
    let (abs_mode, abs_cost) = best_mode(abs);
    let delta_fields = deltas(abs);
    let (d_mode, d_cost) = best_mode(&delta_fields);
    if d_cost < abs_cost {
        (true, d_mode, d_cost)
    } else {
        (false, abs_mode, abs_cost)
    }
}

fn width_for(values: impl Iterator<Item = u64>) -> u64 {
    values.map(|v| encoding::fixed_width(v) as u64).max().unwrap_or(1)
}

/// Picks the layout and per-field compression minimizing the projected
/// encoded size of the batch. Indexed-Column is only considered for
/// batches of at least `column_threshold` records.
pub fn determine_strategy(
    key1s: &[u64],
    key2s: &[u64],
    column_threshold: usize,
    rate_list: f64,
) -> Signature {
    debug_assert_eq!(key1s.len(), key2s.len());
    let n = key1s.len();
    if n == 0 {
        return Signature::new(
            Layout::Row,
            false,
            Compression::None,
            Compression::None,
            false,
        );
    }

    let group_keys: Vec<u64> = key1s.iter().copied().dedup().collect();
    let n_groups = group_keys.len() as u64;

    let (row_delta, row_m1, row_c1) = best_first_encoding(key1s);
    let (row_m2, row_c2) = best_mode(key2s);
    let row_cost = ((BLOCK_COUNT_FIELD + row_c1 + row_c2) as f64 * rate_list) as u64;

    let (cl_delta, cl_m1, cl_c1) = best_first_encoding(&group_keys);
    let second_fields = group_second_fields(key1s, key2s);
    let (cl_m2, cl_c2) = best_mode(&second_fields);
    // One header byte per group; terminators of long groups are noise here
    let cluster_cost = BLOCK_COUNT_FIELD + cl_c1 + n_groups + cl_c2;

    let mut best = (
        row_cost,
        Signature::new(Layout::Row, row_delta, row_m1, row_m2, false),
    );
    if cluster_cost < best.0 {
        best = (
            cluster_cost,
            Signature::new(Layout::DeltaCluster, cl_delta, cl_m1, cl_m2, false),
        );
    }

    if n >= column_threshold {
        let w1 = width_for(group_keys.iter().copied());
        let wc = width_for(std::iter::once(n as u64));
        let ws = width_for(std::iter::once(n as u64));
        let w2 = width_for(key2s.iter().copied());
        let indexed_cost = INDEXED_HEADER + n_groups * (w1 + wc + ws) + n as u64 * w2;
        if indexed_cost < best.0 {
            best = (
                indexed_cost,
                Signature::new(
                    Layout::IndexedColumn,
                    false,
                    Compression::None,
                    Compression::None,
                    false,
                ),
            );
        }
    }

    best.1
}

/// Strategy for a block whose values may already exist in another index.
/// `references[i]` carries the back-reference id for `key2s[i]` when one
/// exists. An aggregated block stores the mixed reference/value stream
/// under Simple-Column; the per-value tag bits saying which entries are
/// references stay with the caller that owns the reference space, so
/// their bytes are charged here even though no layout writes them.
/// References win when their encoded bytes plus those tags undercut
/// storing the values directly.
pub fn determine_aggregated_strategy(
    key1s: &[u64],
    key2s: &[u64],
    references: &[Option<u64>],
    column_threshold: usize,
    rate_list: f64,
) -> Signature {
    debug_assert_eq!(key2s.len(), references.len());
    let n = key2s.len();
    if n == 0 {
        return determine_strategy(key1s, key2s, column_threshold, rate_list);
    }

    let (_, direct_cost) = best_mode(key2s);
    let stored: Vec<u64> = key2s
        .iter()
        .zip(references)
        .map(|(&v, r)| r.unwrap_or(v))
        .collect();
    let (ref_m2, ref_cost) = best_mode(&stored);
    let tag_bytes = n.div_ceil(8) as u64;

    if ref_cost + tag_bytes < direct_cost {
        let (delta, _, _) = best_first_encoding(key1s);
        Signature::new(Layout::SimpleColumn, delta, Compression::None, ref_m2, true)
    } else {
        determine_strategy(key1s, key2s, column_threshold, rate_list)
    }
}
