//! The generational loop.
//!
//! Workers run independently: each owns one agent (and thus one live
//! target process), one RNG stream and one executor, and shares the
//! corpus, the global coverage map and the rule engine with everyone
//! else. The stop flag is observed between generations only; in-flight
//! executions always complete or time out first.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
};

use crate::{
    agent::{Agent, ExecutionResult, TargetExecutor},
    config::EngineConfig,
    corpus::{CorpusManager, EntryId, SharedCorpus, Verdict},
    mutations::{Modification, ModificationScheduler, Strategy, SystematicSweep},
    rands::StdRand,
    rules::RuleEngine,
    trace::Trace,
    Error,
};

/// How many inapplicable operator draws are tolerated per generation
/// before the iteration is given up.
const MAX_MUTATION_ATTEMPTS: u32 = 8;

/// Process-wide run-identifier source, constructed once at startup and
/// handed by handle to every worker.
#[derive(Debug, Default)]
pub struct RunIdManager {
    next: AtomicU64,
}

impl RunIdManager {
    /// A manager starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next unique run id.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// A boxed wire-level collaborator, one per worker.
pub type BoxedExecutor = Box<dyn TargetExecutor + Send>;

/// Sweep state pinned to the base trace it enumerates.
#[derive(Debug)]
struct PinnedSweep {
    parent: EntryId,
    base: Trace,
    sweep: SystematicSweep,
}

/// Per-worker context: RNG stream, agent, executor and strategy state.
pub struct Worker {
    rand: StdRand,
    agent: Agent,
    executor: BoxedExecutor,
    scheduler: ModificationScheduler,
    sweep: Option<PinnedSweep>,
}

// not derivable, the executor is a trait object
impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("rand", &self.rand)
            .field("agent", &self.agent)
            .field("scheduler", &self.scheduler)
            .field("sweep", &self.sweep)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Builds worker `index` with its own deterministic RNG stream.
    pub fn new(
        index: u64,
        config: &Arc<EngineConfig>,
        executor: BoxedExecutor,
    ) -> Result<Self, Error> {
        Ok(Self {
            rand: StdRand::with_seed(config.seed ^ index),
            agent: Agent::new(Arc::clone(config)),
            executor,
            scheduler: ModificationScheduler::new(&config.weights)?,
            sweep: None,
        })
    }
}

/// Everything one generation produced, for logging and tests.
#[derive(Debug)]
pub struct IterationOutcome {
    /// The parent the child was grown from.
    pub parent: EntryId,
    /// The modification that produced the child.
    pub modification: Modification,
    /// The execution's full result.
    pub result: ExecutionResult,
    /// Whether the corpus kept the child.
    pub verdict: Verdict,
    /// Whether any rule matched.
    pub rule_matched: bool,
}

/// The orchestrator of the evolutionary search.
#[derive(Debug)]
pub struct Fuzzer {
    config: Arc<EngineConfig>,
    corpus: SharedCorpus,
    rules: Arc<Mutex<RuleEngine>>,
    stop: Arc<AtomicBool>,
    ids: Arc<RunIdManager>,
}

impl Fuzzer {
    /// Validates the configuration and seeds the corpus with the
    /// generation-zero handshake.
    pub fn new(config: Arc<EngineConfig>) -> Result<Self, Error> {
        config.validate()?;
        let mut manager = CorpusManager::new(config.map_len, config.max_staleness);
        manager.seed(Trace::client_handshake());
        let rules = RuleEngine::standard(&config.findings_dir);
        Ok(Self {
            corpus: SharedCorpus::new(manager),
            rules: Arc::new(Mutex::new(rules)),
            stop: Arc::new(AtomicBool::new(false)),
            ids: Arc::new(RunIdManager::new()),
            config,
        })
    }

    /// The shared corpus (for inspection and tests).
    #[must_use]
    pub fn corpus(&self) -> &SharedCorpus {
        &self.corpus
    }

    /// Handle to the cooperative stop flag.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Asks every worker to exit after its current generation.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Picks the parent and the modification for the next child
    /// according to the configured strategy.
    fn next_child(&self, worker: &mut Worker) -> Result<(EntryId, Modification, Trace), Error> {
        match self.config.strategy {
            Strategy::Random { stack } => {
                for _ in 0..MAX_MUTATION_ATTEMPTS {
                    let Some((parent_id, parent)) = self.corpus.select_parent(&mut worker.rand)
                    else {
                        return Err(Error::structural("corpus is empty"));
                    };
                    let (modification, _) =
                        worker
                            .scheduler
                            .generate_stacked(&parent, stack, &mut worker.rand);
                    if let Some(modification) = modification {
                        match modification.apply(&parent) {
                            Ok(child) if child == parent => {
                                // the composition cancelled out, redraw
                                log::debug!("skipping identity composition");
                            }
                            Ok(child) => return Ok((parent_id, modification, child)),
                            Err(Error::Structural(msg)) => {
                                // skip this operator, reselect
                                log::debug!("skipping structural mismatch: {msg}");
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    // every draw was inapplicable, reselect the parent
                }
                Err(Error::structural(
                    "no applicable operator after maximum attempts",
                ))
            }
            Strategy::Systematic => {
                let needs_rebuild = worker
                    .sweep
                    .as_ref()
                    .map_or(true, |pinned| pinned.sweep.exhausted());
                if needs_rebuild {
                    let Some((parent_id, parent)) = self.corpus.select_parent(&mut worker.rand)
                    else {
                        return Err(Error::structural("corpus is empty"));
                    };
                    let sweep = SystematicSweep::new(&parent);
                    worker.sweep = Some(PinnedSweep {
                        parent: parent_id,
                        base: parent,
                        sweep,
                    });
                }
                let pinned = worker.sweep.as_mut().expect("sweep was just pinned");
                let modification = pinned
                    .sweep
                    .next_modification(&pinned.base, &mut worker.rand)
                    .ok_or_else(|| Error::structural("base trace has no modifiable fields"))?;
                let child = modification.apply(&pinned.base)?;
                Ok((pinned.parent, modification, child))
            }
        }
    }

    /// One generation: select, mutate, execute, score, classify.
    ///
    /// Crash and timeout of the *target* are ordinary data here; only
    /// engine-side lifecycle misuse aborts the iteration. Refuses with
    /// [`Error::ShuttingDown`] once the stop flag is raised.
    pub fn fuzz_one(&self, worker: &mut Worker) -> Result<IterationOutcome, Error> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(Error::ShuttingDown);
        }
        let (parent, modification, child) = self.next_child(worker)?;
        let run_id = self.ids.next_id();

        worker.agent.start(run_id)?;
        let exec_res = worker.executor.execute_trace(&child);
        // the process is released on every path, even a failed exchange
        let stop_res = worker.agent.stop();
        let observed = match exec_res {
            Ok(observed) => observed,
            Err(err) => {
                log::debug!("run {run_id}: protocol exchange failed: {err}");
                Trace::new()
            }
        };
        stop_res?;

        let result = worker.agent.collect_result(child, observed)?;
        let rule_matched = self
            .rules
            .lock()
            .expect("rule engine lock poisoned")
            .analyze(&result);
        let verdict = self.corpus.consider(&result, Some(parent), rule_matched)?;

        if result.crash() || result.timeout() {
            log::info!(
                "run {run_id}: target ended with {:?}, verdict {verdict:?}",
                result.exit
            );
        }
        Ok(IterationOutcome {
            parent,
            modification,
            result,
            verdict,
            rule_matched,
        })
    }

    /// Runs generations on this worker until the stop flag is raised.
    /// Iteration-local errors are logged and skipped.
    pub fn fuzz_loop(&self, worker: &mut Worker) {
        let mut generation: u64 = 0;
        while !self.stop.load(Ordering::Relaxed) {
            match self.fuzz_one(worker) {
                Ok(outcome) => {
                    if let Verdict::Retained(id) = outcome.verdict {
                        log::debug!(
                            "generation {generation}: retained {id:?} ({} sites covered)",
                            self.corpus.with(|corpus| corpus.sites_covered())
                        );
                    }
                }
                Err(Error::ShuttingDown) => break,
                Err(err) => log::warn!("generation {generation} aborted: {err}"),
            }
            generation += 1;
        }
    }

    /// Runs `workers` in parallel scoped threads until someone raises
    /// the stop flag. Each worker owns its agent and target process.
    pub fn fuzz_loop_multi(&self, workers: Vec<Worker>) {
        thread::scope(|scope| {
            for mut worker in workers {
                scope.spawn(move || self.fuzz_loop(&mut worker));
            }
        });
    }

    /// The shutdown summary concatenated from every rule's report.
    #[must_use]
    pub fn report(&self) -> String {
        self.rules
            .lock()
            .expect("rule engine lock poisoned")
            .report()
    }
}
