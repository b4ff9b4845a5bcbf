//! Branch-coverage bookkeeping.
//!
//! Every execution of the target produces a fixed-length vector of
//! per-site hit counters, written by the instrumentation wrapper as
//! newline-delimited `index:count` pairs. The map length is a property
//! of the target binary and is fixed at configuration time; maps of
//! different lengths never meet outside of a configuration mistake.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Hit counters for one execution, indexed by instrumentation site.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageMap {
    entries: Vec<u64>,
}

impl CoverageMap {
    /// An all-zero map of the given length.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            entries: vec![0; len],
        }
    }

    /// The number of instrumentation sites.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the map has no sites at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The counter at `idx`.
    #[must_use]
    pub fn hits(&self, idx: usize) -> u64 {
        self.entries[idx]
    }

    /// The number of sites hit at least once.
    #[must_use]
    pub fn covered(&self) -> usize {
        self.entries.iter().filter(|&&c| c != 0).count()
    }

    /// Merges `other` into `self` by index-wise maximum.
    ///
    /// Commutative, associative and idempotent. Maps of different
    /// lengths belong to different target binaries, so a length
    /// mismatch is a configuration error.
    pub fn merge(&mut self, other: &CoverageMap) -> Result<(), Error> {
        if self.len() != other.len() {
            return Err(Error::configuration(format!(
                "cannot merge coverage maps of different lengths ({} vs {})",
                self.len(),
                other.len()
            )));
        }
        for (mine, theirs) in self.entries.iter_mut().zip(&other.entries) {
            *mine = (*mine).max(*theirs);
        }
        Ok(())
    }

    /// True if any counter of `self` exceeds the corresponding counter
    /// of `global`.
    #[must_use]
    pub fn is_novel(&self, global: &CoverageMap) -> bool {
        self.entries
            .iter()
            .zip(&global.entries)
            .any(|(candidate, seen)| candidate > seen)
    }

    /// The number of sites where `self` exceeds `global`. A finer
    /// fitness signal than the boolean [`CoverageMap::is_novel`].
    #[must_use]
    pub fn diff_count(&self, global: &CoverageMap) -> usize {
        self.entries
            .iter()
            .zip(&global.entries)
            .filter(|(candidate, seen)| candidate > seen)
            .count()
    }

    /// Parses an instrumentation hit-count file (`index:count` per line)
    /// into a map of length `len`.
    ///
    /// A line that does not split into two integers, or an index outside
    /// the map, rejects the whole file. If the same index occurs twice
    /// the last occurrence wins.
    pub fn from_hitcount_file<P: AsRef<Path>>(path: P, len: usize) -> Result<Self, Error> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut map = Self::new(len);
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let (idx, count) = line
                .split_once(':')
                .ok_or_else(|| bad_line(&line))
                .and_then(|(idx, count)| {
                    let idx = idx.trim().parse::<usize>().map_err(|_| bad_line(&line))?;
                    let count = count.trim().parse::<u64>().map_err(|_| bad_line(&line))?;
                    Ok((idx, count))
                })?;
            if idx >= len {
                return Err(Error::instrumentation_parse(format!(
                    "site index {idx} outside coverage map of length {len}"
                )));
            }
            map.entries[idx] = count;
        }
        Ok(map)
    }
}

fn bad_line(line: &str) -> Error {
    Error::instrumentation_parse(format!("unparsable hit-count line: {line:?}"))
}
