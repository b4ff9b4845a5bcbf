//! The retained population and the fitness policy.
//!
//! A completed execution is retained when it reaches coverage never
//! seen in the global map, or when any rule matched on it. Parents are
//! drawn staleness-weighted so that recently productive entries are
//! preferred while every entry keeps a non-zero selection probability.

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{
    agent::ExecutionResult,
    coverage::CoverageMap,
    rands::{Rand, StdRand},
    trace::Trace,
    Error,
};

/// Identifier of one corpus entry, unique within the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

/// A retained trace with its last-known coverage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorpusEntry {
    /// The retained trace.
    pub trace: Trace,
    /// Coverage of the execution that earned retention.
    pub coverage: CoverageMap,
    /// Generation the entry was inserted in.
    pub generation: u64,
    /// Selections since this entry last produced a retained child.
    pub staleness: u64,
}

/// Whether a result made it into the corpus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Retained under the given id.
    Retained(EntryId),
    /// Discarded, nothing novel and no rule matched.
    Discarded,
}

/// Owns the population, the global coverage map and the retention
/// policy. Shared across workers through [`SharedCorpus`].
#[derive(Debug)]
pub struct CorpusManager {
    entries: HashMap<EntryId, CorpusEntry>,
    /// Insertion order, the id source for weighted selection.
    ids: Vec<EntryId>,
    next_id: u64,
    global: CoverageMap,
    generation: u64,
    max_staleness: Option<u64>,
}

impl CorpusManager {
    /// An empty corpus over a global map of `map_len` sites.
    #[must_use]
    pub fn new(map_len: usize, max_staleness: Option<u64>) -> Self {
        Self {
            entries: HashMap::new(),
            ids: Vec::new(),
            next_id: 0,
            global: CoverageMap::new(map_len),
            generation: 0,
            max_staleness,
        }
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True if nothing has been retained yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The merged coverage of every retained execution.
    #[must_use]
    pub fn global_coverage(&self) -> &CoverageMap {
        &self.global
    }

    /// Number of sites ever hit across all retained runs.
    #[must_use]
    pub fn sites_covered(&self) -> usize {
        self.global.covered()
    }

    /// The entry behind `id`, if still retained.
    #[must_use]
    pub fn entry(&self, id: EntryId) -> Option<&CorpusEntry> {
        self.entries.get(&id)
    }

    /// Seeds the corpus with a generation-zero trace.
    pub fn seed(&mut self, trace: Trace) -> EntryId {
        let map_len = self.global.len();
        self.insert(trace, CoverageMap::new(map_len))
    }

    fn insert(&mut self, trace: Trace, coverage: CoverageMap) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            CorpusEntry {
                trace,
                coverage,
                generation: self.generation,
                staleness: 0,
            },
        );
        self.ids.push(id);
        id
    }

    /// Scores one result: retained when its coverage is novel under the
    /// global map or `rule_matched` is set, discarded otherwise.
    ///
    /// On retention the run coverage is merged into the global map, the
    /// parent's staleness is reset (it just produced a novel
    /// descendant), and over-stale entries are evicted.
    pub fn consider(
        &mut self,
        result: &ExecutionResult,
        parent: Option<EntryId>,
        rule_matched: bool,
    ) -> Result<Verdict, Error> {
        self.generation += 1;
        let novel = result.coverage.is_novel(&self.global);
        if !novel && !rule_matched {
            return Ok(Verdict::Discarded);
        }

        let novel_sites = result.coverage.diff_count(&self.global);
        self.global.merge(&result.coverage)?;
        let id = self.insert(result.trace.clone(), result.coverage.clone());
        if let Some(parent) = parent {
            if let Some(entry) = self.entries.get_mut(&parent) {
                entry.staleness = 0;
            }
        }
        self.evict(id);
        log::debug!(
            "run {}: retained as {id:?} (novel sites: {novel_sites}, rule match: {rule_matched})",
            result.run_id
        );
        Ok(Verdict::Retained(id))
    }

    /// Drops entries whose staleness exceeds the configured bound.
    /// Never drops `keep`, and never empties the corpus.
    fn evict(&mut self, keep: EntryId) {
        let Some(bound) = self.max_staleness else {
            return;
        };
        let mut idx = 0;
        while idx < self.ids.len() {
            let id = self.ids[idx];
            let stale = self.entries[&id].staleness > bound;
            if stale && id != keep && self.ids.len() > 1 {
                self.entries.remove(&id);
                self.ids.remove(idx);
                log::debug!("evicted stale corpus entry {id:?}");
            } else {
                idx += 1;
            }
        }
    }

    /// Draws a parent for the next generation, weighted by
    /// `1 / (1 + staleness)` so that no entry ever reaches probability
    /// zero. The chosen entry's staleness is bumped; the returned trace
    /// is an independent clone (clone-on-select).
    pub fn select_parent(&mut self, rand: &mut StdRand) -> Option<(EntryId, Trace)> {
        if self.ids.is_empty() {
            return None;
        }
        // integer weights: scale 1/(1+s) onto max_stale+1 .. 1
        let max_stale = self
            .ids
            .iter()
            .map(|id| self.entries[id].staleness)
            .max()
            .unwrap_or(0);
        let weights: Vec<u64> = self
            .ids
            .iter()
            .map(|id| max_stale - self.entries[id].staleness + 1)
            .collect();
        let total: u64 = weights.iter().sum();
        let mut ticket = rand.below(total);
        let mut chosen = *self.ids.last().unwrap();
        for (id, weight) in self.ids.iter().zip(&weights) {
            if ticket < *weight {
                chosen = *id;
                break;
            }
            ticket -= weight;
        }
        let entry = self.entries.get_mut(&chosen).unwrap();
        entry.staleness += 1;
        Some((chosen, entry.trace.clone()))
    }
}

/// The single mutual-exclusion domain shared by all workers: corpus
/// reads, global-map merges and insertions are serialized here.
#[derive(Clone, Debug)]
pub struct SharedCorpus {
    inner: Arc<Mutex<CorpusManager>>,
}

impl SharedCorpus {
    /// Wraps a manager for sharing.
    #[must_use]
    pub fn new(manager: CorpusManager) -> Self {
        Self {
            inner: Arc::new(Mutex::new(manager)),
        }
    }

    /// Runs `f` under the corpus lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut CorpusManager) -> R) -> R {
        let mut guard = self.inner.lock().expect("corpus lock poisoned");
        f(&mut guard)
    }

    /// [`CorpusManager::consider`], atomically with the global merge.
    pub fn consider(
        &self,
        result: &ExecutionResult,
        parent: Option<EntryId>,
        rule_matched: bool,
    ) -> Result<Verdict, Error> {
        self.with(|manager| manager.consider(result, parent, rule_matched))
    }

    /// [`CorpusManager::select_parent`] under the lock.
    pub fn select_parent(&self, rand: &mut StdRand) -> Option<(EntryId, Trace)> {
        self.with(|manager| manager.select_parent(rand))
    }
}
