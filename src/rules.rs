//! Post-execution analyzers.
//!
//! Every completed [`ExecutionResult`] is run through all configured
//! rules, unconditionally and order-insensitively. A rule that matches
//! persists the full trace plus a short annotation under its own
//! subdirectory of the findings root and counts the match; on shutdown
//! the per-rule reports are concatenated into the final summary.
//!
//! The rule set is a closed sum type dispatched by `match`, so adding
//! a rule is an exhaustiveness-checked change, not a subclass.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    agent::ExecutionResult,
    trace::{MessageType, Trace},
    Error,
};

/// State shared by every rule: how often it fired and where its
/// findings go.
#[derive(Clone, Debug)]
struct RuleState {
    found: u64,
    output_dir: PathBuf,
}

impl RuleState {
    fn new(findings_root: &Path, name: &str) -> Self {
        Self {
            found: 0,
            output_dir: findings_root.join(name),
        }
    }

    fn persist(&mut self, result: &ExecutionResult, annotation: &str) -> Result<(), Error> {
        fs::create_dir_all(&self.output_dir)?;
        let mut trace = result.trace.clone();
        trace.description = Some(annotation.to_string());
        trace.save(self.output_dir.join(format!("{}.json", result.run_id)))?;
        self.found += 1;
        Ok(())
    }
}

/// One pluggable analyzer.
#[derive(Clone, Debug)]
pub enum Rule {
    /// A heartbeat arrived from the peer before (or without) its
    /// Finished message.
    EarlyHeartbeat(RuleInner),
    /// The target crashed.
    Crash(RuleInner),
    /// The target (or its watchdog) timed out.
    Timeout(RuleInner),
}

/// Concrete per-rule state, public only through [`Rule`].
#[derive(Clone, Debug)]
pub struct RuleInner {
    state: RuleState,
}

impl Rule {
    /// The early/out-of-order heartbeat rule.
    #[must_use]
    pub fn early_heartbeat(findings_root: &Path) -> Self {
        Rule::EarlyHeartbeat(RuleInner {
            state: RuleState::new(findings_root, "early_heartbeat"),
        })
    }

    /// The crash rule.
    #[must_use]
    pub fn crash(findings_root: &Path) -> Self {
        Rule::Crash(RuleInner {
            state: RuleState::new(findings_root, "crash"),
        })
    }

    /// The timeout rule.
    #[must_use]
    pub fn timeout(findings_root: &Path) -> Self {
        Rule::Timeout(RuleInner {
            state: RuleState::new(findings_root, "timeout"),
        })
    }

    fn name(&self) -> &'static str {
        match self {
            Rule::EarlyHeartbeat(_) => "early_heartbeat",
            Rule::Crash(_) => "crash",
            Rule::Timeout(_) => "timeout",
        }
    }

    fn state_mut(&mut self) -> &mut RuleState {
        match self {
            Rule::EarlyHeartbeat(inner) | Rule::Crash(inner) | Rule::Timeout(inner) => {
                &mut inner.state
            }
        }
    }

    fn state(&self) -> &RuleState {
        match self {
            Rule::EarlyHeartbeat(inner) | Rule::Crash(inner) | Rule::Timeout(inner) => {
                &inner.state
            }
        }
    }

    /// Pure predicate over one completed execution.
    #[must_use]
    pub fn applies(&self, result: &ExecutionResult) -> bool {
        match self {
            Rule::EarlyHeartbeat(_) => heartbeat_out_of_order(&result.observed),
            Rule::Crash(_) => result.crash(),
            Rule::Timeout(_) => result.timeout(),
        }
    }

    fn annotation(&self) -> &'static str {
        match self {
            Rule::EarlyHeartbeat(_) => {
                "observed a heartbeat from the peer before its Finished message"
            }
            Rule::Crash(_) => "target crashed during this trace",
            Rule::Timeout(_) => "target timed out during this trace",
        }
    }

    /// Side effect on a match: persists trace and annotation, bumps the
    /// match counter.
    pub fn on_apply(&mut self, result: &ExecutionResult) -> Result<(), Error> {
        let annotation = self.annotation();
        self.state_mut().persist(result, annotation)
    }

    /// Hook for rules that track negative evidence. None of the
    /// current rules do.
    pub fn on_decline(&mut self, _result: &ExecutionResult) {}

    /// Human-readable summary, `None` if the rule never matched.
    #[must_use]
    pub fn report(&self) -> Option<String> {
        let found = self.state().found;
        if found == 0 {
            return None;
        }
        Some(match self {
            Rule::EarlyHeartbeat(_) => {
                format!("Found {found} traces with early heartbeat messages from the peer")
            }
            Rule::Crash(_) => format!("Found {found} crashing traces"),
            Rule::Timeout(_) => format!("Found {found} timed-out traces"),
        })
    }
}

/// True if the observed trace contains a received heartbeat and either
/// no received Finished at all, or the first heartbeat precedes the
/// first Finished in trace order.
fn heartbeat_out_of_order(observed: &Trace) -> bool {
    let Some(heartbeat) = observed.first_received(MessageType::Heartbeat) else {
        return false;
    };
    match observed.first_received(MessageType::Finished) {
        None => true,
        Some(finished) => heartbeat < finished,
    }
}

/// Runs every configured rule against every result.
#[derive(Debug)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    /// An engine over the given rules.
    #[must_use]
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// The default rule set, rooted at `findings_root`.
    #[must_use]
    pub fn standard(findings_root: &Path) -> Self {
        Self::new(vec![
            Rule::early_heartbeat(findings_root),
            Rule::crash(findings_root),
            Rule::timeout(findings_root),
        ])
    }

    /// Applies all rules to one result and reports whether any
    /// matched. Persistence failures are logged and skipped, they
    /// never abort the run.
    pub fn analyze(&mut self, result: &ExecutionResult) -> bool {
        let mut matched = false;
        for rule in &mut self.rules {
            if rule.applies(result) {
                matched = true;
                if let Err(err) = rule.on_apply(result) {
                    log::error!(
                        "rule {}: could not persist finding for run {}: {err}",
                        rule.name(),
                        result.run_id
                    );
                }
            } else {
                rule.on_decline(result);
            }
        }
        matched
    }

    /// The shutdown summary: every rule's report, one per line,
    /// matchless rules skipped.
    #[must_use]
    pub fn report(&self) -> String {
        self.rules
            .iter()
            .filter_map(Rule::report)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use std::{env, fs, path::PathBuf, time::SystemTime};

    use super::{Rule, RuleEngine};
    use crate::{
        agent::{ExecutionResult, ExitKind},
        coverage::CoverageMap,
        trace::{Action, ConnectionEnd, Message, MessageType, Trace},
    };

    fn observed_from_server(types: &[MessageType]) -> Trace {
        Trace {
            actions: vec![Action::Receive {
                messages: types
                    .iter()
                    .map(|t| Message::new(*t, ConnectionEnd::Server))
                    .collect(),
            }],
            description: None,
        }
    }

    fn result_with_observed(observed: Trace, exit: ExitKind) -> ExecutionResult {
        ExecutionResult {
            run_id: 1,
            trace: Trace::client_handshake(),
            observed,
            exit,
            started: SystemTime::UNIX_EPOCH,
            stopped: SystemTime::UNIX_EPOCH,
            coverage: CoverageMap::new(4),
            hitcount_file: PathBuf::new(),
            log_file: PathBuf::new(),
        }
    }

    fn findings_root() -> PathBuf {
        env::temp_dir().join("evofuzz-rule-tests")
    }

    #[test]
    fn test_heartbeat_without_finished_applies() {
        use MessageType::{ClientHello, Heartbeat, ServerHello};
        let rule = Rule::early_heartbeat(&findings_root());
        let result = result_with_observed(
            observed_from_server(&[ClientHello, ServerHello, Heartbeat]),
            ExitKind::Ok,
        );
        assert!(rule.applies(&result));
    }

    #[test]
    fn test_heartbeat_after_finished_does_not_apply() {
        use MessageType::{ClientHello, Finished, Heartbeat, ServerHello};
        let rule = Rule::early_heartbeat(&findings_root());
        let result = result_with_observed(
            observed_from_server(&[ClientHello, ServerHello, Finished, Heartbeat]),
            ExitKind::Ok,
        );
        assert!(!rule.applies(&result));
    }

    #[test]
    fn test_heartbeat_before_finished_applies() {
        use MessageType::{ClientHello, Finished, Heartbeat, ServerHello};
        let rule = Rule::early_heartbeat(&findings_root());
        let result = result_with_observed(
            observed_from_server(&[ClientHello, ServerHello, Heartbeat, Finished]),
            ExitKind::Ok,
        );
        assert!(rule.applies(&result));
    }

    #[test]
    fn test_report_is_none_until_first_match() {
        let root = findings_root().join("report-none");
        let mut rule = Rule::crash(&root);
        assert!(rule.report().is_none());

        let result = result_with_observed(Trace::new(), ExitKind::Crash);
        assert!(rule.applies(&result));
        rule.on_apply(&result).unwrap();
        let report = rule.report().unwrap();
        assert!(report.contains('1'));
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_match_persists_annotated_trace() {
        let root = findings_root().join("persist");
        let mut engine = RuleEngine::standard(&root);
        let result = result_with_observed(Trace::new(), ExitKind::Crash);
        assert!(engine.analyze(&result));

        let finding = root.join("crash").join("1.json");
        let loaded = Trace::load(&finding).unwrap();
        assert!(loaded.description.unwrap().contains("crashed"));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_engine_report_skips_matchless_rules() {
        let root = findings_root().join("summary");
        let mut engine = RuleEngine::standard(&root);
        let result = result_with_observed(Trace::new(), ExitKind::Timeout);
        engine.analyze(&result);

        let report = engine.report();
        assert!(report.contains("timed-out"));
        assert!(!report.contains("crashing"));
        fs::remove_dir_all(&root).unwrap();
    }
}
