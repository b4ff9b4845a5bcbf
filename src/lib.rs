/*!
Evolutionary, coverage-guided fuzzing for stateful TLS implementations.

The engine drives an external client or server through mutated handshake
[`Trace`]s, reads branch-coverage feedback written by an instrumentation
wrapper, keeps the interesting traces in a [`corpus`], and classifies every
completed run through a set of [`rules`].

The wire-level protocol work (message encoding, record-layer crypto, the
actual network exchange) lives behind the [`agent::TargetExecutor`] seam;
this crate only decides *what* to send and *what to keep*.

[`Trace`]: trace::Trace
*/

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation
)]
#![cfg_attr(
    not(debug_assertions),
    deny(
        missing_docs,
        missing_debug_implementations,
        trivial_numeric_casts,
        unused_import_braces,
        unused_must_use,
        unused_qualifications
    )
)]

pub mod agent;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod fuzzer;
pub mod mutations;
pub mod rands;
pub mod rules;
pub mod trace;

use core::fmt;
use std::io;

/// The crate-wide error type.
///
/// One variant per failure class. Errors local to a single execution
/// (lifecycle misuse, instrumentation parsing) are handled inside the
/// generational loop and never terminate the whole run; only
/// [`Error::Configuration`] is fatal, and only at startup.
#[derive(Debug)]
pub enum Error {
    /// A modification referenced a nonexistent action, message or field.
    Structural(String),
    /// Agent `start`/`stop` called out of sequence.
    AgentLifecycle(String),
    /// A coverage hit-count file could not be parsed. The whole file is
    /// rejected, not just the offending line.
    InstrumentationParse(String),
    /// Trace or finding (de)serialization failed.
    Serialize(String),
    /// Invalid engine configuration. Fatal at startup.
    Configuration(String),
    /// File or process I/O failed.
    File(io::Error),
    /// The engine is shutting down, not really an error.
    ShuttingDown,
}

impl Error {
    /// A modification referenced a nonexistent action, message or field.
    #[must_use]
    pub fn structural<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Structural(arg.into())
    }

    /// Agent `start`/`stop` called out of sequence.
    #[must_use]
    pub fn agent_lifecycle<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::AgentLifecycle(arg.into())
    }

    /// A coverage hit-count file could not be parsed.
    #[must_use]
    pub fn instrumentation_parse<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::InstrumentationParse(arg.into())
    }

    /// Trace or finding (de)serialization failed.
    #[must_use]
    pub fn serialize<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Serialize(arg.into())
    }

    /// Invalid engine configuration.
    #[must_use]
    pub fn configuration<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Configuration(arg.into())
    }

    /// File or process I/O failed.
    #[must_use]
    pub fn file(arg: io::Error) -> Self {
        Error::File(arg)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Structural(s) => write!(f, "structural error: {s}"),
            Error::AgentLifecycle(s) => write!(f, "agent lifecycle error: {s}"),
            Error::InstrumentationParse(s) => {
                write!(f, "instrumentation parse error: {s}")
            }
            Error::Serialize(s) => write!(f, "serialization error: {s}"),
            Error::Configuration(s) => write!(f, "configuration error: {s}"),
            Error::File(err) => write!(f, "file error: {err}"),
            Error::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::File(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::file(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialize(format!("{err}"))
    }
}
