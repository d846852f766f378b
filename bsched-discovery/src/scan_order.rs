// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Candidate-principal scan order: a binary-tree walk over host
//! positions in a subnet. `level()` below is the same
//! `floor(log2(x))` computation as the `log2` helper in
//! `original_source/src/apps/discovery/discovery.hh`, which is as far as
//! that file goes — it supplies `log2`/`Interval` only, not the walk
//! itself, so the tree-walk algorithm below is this crate's own.
//!
//! Hosts within a subnet are numbered 1..=n by their position (the host
//! index gets a leading 1 bit added, matching a binary tree rooted at
//! position 1: position `p`'s parent is `p / 2`, its children are `2p`
//! and `2p + 1`). The walk has two equivalent readings: explicit
//! parent-then-parent's-siblings traversal, or sorting every other
//! position by `(level-difference, absolute-rank-difference)` from the
//! local position. This iterator takes the second reading literally,
//! since it is the one a cursor persistent across probes can be
//! expressed over with a plain sorted `Vec` and an index.

/// `floor(log2(x))` for `x >= 1`, i.e. the tree depth of position `x`
/// when the tree is rooted at position 1.
fn level(x: u32) -> u32 {
    debug_assert!(x >= 1);
    31 - x.leading_zeros()
}

/// Deterministic, persistent-across-probes candidate scan over every
/// other position in `1..=last_position`; exhaustion yields an empty
/// candidate set.
pub struct PrincipalScanOrder {
    candidates: Vec<u32>,
    cursor: usize,
}

impl PrincipalScanOrder {
    /// `self_position` is this host's 1-based position in the subnet;
    /// `last_position` is the highest valid position (typically the
    /// subnet's host count).
    pub fn new(self_position: u32, last_position: u32) -> Self {
        let mut candidates: Vec<u32> = (1..=last_position).filter(|&x| x != self_position).collect();
        let self_level = level(self_position.max(1));
        candidates.sort_by_key(|&x| {
            let level_diff = level(x.max(1)).abs_diff(self_level);
            let rank_diff = x.abs_diff(self_position);
            (level_diff, rank_diff)
        });
        PrincipalScanOrder { candidates, cursor: 0 }
    }

    /// Advances the persistent cursor and returns the next candidate, or
    /// `None` once every candidate has been probed.
    pub fn next(&mut self) -> Option<u32> {
        let candidate = self.candidates.get(self.cursor).copied();
        if candidate.is_some() {
            self.cursor += 1;
        }
        candidate
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.candidates.len()
    }
}
