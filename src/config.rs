//! Engine configuration.
//!
//! Built once at startup through the builder, validated once, then
//! shared read-only with every worker. All validation failures are
//! [`Error::Configuration`] and refuse the engine to begin.

use std::{env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    mutations::{ModificationKind, Strategy},
    Error,
};

fn default_weights() -> Vec<(ModificationKind, u64)> {
    ModificationKind::ALL.iter().map(|kind| (*kind, 1)).collect()
}

/// Everything the engine needs to know, in one place.
#[derive(Clone, Debug, Serialize, Deserialize, TypedBuilder)]
pub struct EngineConfig {
    /// Target invocation template. `[output]`, `[id]`, `[cert]` and
    /// `[key]` are substituted before launch; the instrumentation
    /// wrapper is expected to write its hit counts to
    /// `[output]/[id].cov`.
    #[builder(setter(into))]
    pub command: String,

    /// Directory for per-run artifacts (hit-count and log files).
    #[builder(setter(into))]
    pub output_dir: PathBuf,

    /// Root directory for rule findings, one subdirectory per rule.
    #[builder(setter(into))]
    pub findings_dir: PathBuf,

    /// Certificate the target is started with.
    #[builder(setter(into))]
    pub cert_file: PathBuf,

    /// Private key the target is started with.
    #[builder(setter(into))]
    pub key_file: PathBuf,

    /// Length of the coverage map, fixed by the target binary.
    pub map_len: usize,

    /// Watchdog budget for one target execution.
    #[builder(default = Duration::from_secs(10))]
    pub exec_timeout: Duration,

    /// Exit code the wrapper reports for a crashed target.
    #[builder(default = 2)]
    pub crash_exit_code: i32,

    /// Exit code the wrapper reports when the target timed out.
    #[builder(default = 1)]
    pub timeout_exit_code: i32,

    /// Operator selection weights.
    #[builder(default = default_weights())]
    pub weights: Vec<(ModificationKind, u64)>,

    /// Operator selection strategy.
    #[builder(default = Strategy::Random { stack: 4 })]
    pub strategy: Strategy,

    /// Corpus entries whose staleness exceeds this are evicted. `None`
    /// keeps the corpus unbounded, trading memory for search breadth.
    #[builder(default = None)]
    pub max_staleness: Option<u64>,

    /// Base seed; worker `i` runs on `seed ^ i` for a reproducible
    /// per-worker stream.
    #[builder(default = 0x5EED)]
    pub seed: u64,
}

impl EngineConfig {
    /// Checks the configuration, fatal on the first violation.
    pub fn validate(&self) -> Result<(), Error> {
        let program = self
            .command
            .split_whitespace()
            .next()
            .ok_or_else(|| Error::configuration("empty target command"))?;
        if !program_exists(program) {
            return Err(Error::configuration(format!(
                "target binary not found: {program}"
            )));
        }
        if self.map_len == 0 {
            return Err(Error::configuration("coverage map length must not be zero"));
        }
        if self.exec_timeout.is_zero() {
            return Err(Error::configuration("execution timeout must not be zero"));
        }
        if self.crash_exit_code == self.timeout_exit_code {
            return Err(Error::configuration(format!(
                "crash and timeout exit codes must differ (both {})",
                self.crash_exit_code
            )));
        }
        if self.weights.iter().map(|(_, w)| *w).sum::<u64>() == 0 {
            return Err(Error::configuration(
                "operator weights must not sum to zero",
            ));
        }
        if let Strategy::Random { stack: 0 } = self.strategy {
            return Err(Error::configuration("mutation stack must not be zero"));
        }
        Ok(())
    }
}

fn program_exists(program: &str) -> bool {
    let path = PathBuf::from(program);
    if path.components().count() > 1 {
        return path.exists();
    }
    // bare name, resolve against PATH like the shell would
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(program).exists()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::EngineConfig;
    use crate::{mutations::ModificationKind, Error};

    fn valid_config() -> EngineConfig {
        let tmp = env::temp_dir();
        EngineConfig::builder()
            .command("true [output] [id] [cert] [key]")
            .output_dir(tmp.join("evofuzz-out"))
            .findings_dir(tmp.join("evofuzz-findings"))
            .cert_file(tmp.join("cert.pem"))
            .key_file(tmp.join("key.pem"))
            .map_len(64)
            .build()
    }

    #[test]
    fn test_defaults_validate() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn test_missing_binary_is_fatal() {
        let mut config = valid_config();
        config.command = "/definitely/not/a/binary".into();
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_map_len_is_fatal() {
        let mut config = valid_config();
        config.map_len = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_equal_exit_codes_are_fatal() {
        let mut config = valid_config();
        config.crash_exit_code = 7;
        config.timeout_exit_code = 7;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_zero_weight_sum_is_fatal() {
        let mut config = valid_config();
        config.weights = vec![(ModificationKind::ReplaceField, 0)];
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}
