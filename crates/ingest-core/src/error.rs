//! Failure classification taxonomy.
//!
//! Every error that can surface from parsing through commit is tagged with a
//! `FailureKind`. The tag, not the error's `Display` text, is what the retry
//! loop and circuit breaker branch on — matching on message strings would be
//! fragile across upstream dependency upgrades.

use thiserror::Error;

/// Coarse classification of why an operation failed, used to decide whether
/// to retry, route to the dead-letter topic, or trip the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Malformed payload: truncated JSON, unparseable CSV row, unknown format.
    Parse,
    /// Payload doesn't conform to the canonical schema and the mismatch isn't
    /// a sanctioned widening (missing required field, type conflict).
    Schema,
    /// Close-of-business / partition-date field missing, unparseable, or out
    /// of the configured lookback window.
    Cob,
    /// Passed parsing and schema checks but failed a business validation rule.
    Validation,
    /// Broker unreachable, rebalance in flight, timeout — retry against the
    /// same broker is expected to eventually succeed.
    TransientBroker,
    /// Object store unreachable, throttled, or returned a 5xx.
    TransientStore,
    /// Optimistic commit lost a race against a concurrent writer.
    CommitConflict,
    /// Static misconfiguration: unknown topic, invalid YAML, failed validation.
    Config,
    /// Not itself a failure of this record: the topic's circuit breaker is
    /// `OPEN` and every incoming record is routed straight to the DLR until
    /// it recovers.
    CircuitOpen,
}

impl FailureKind {
    /// Whether retrying the same operation (after backoff) can plausibly
    /// succeed. `Parse`, `Schema`, `Cob`, `Validation` and `Config` are
    /// deterministic functions of the input — retrying them wastes a retry
    /// budget on a slot and Dead-Letters instead.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            FailureKind::TransientBroker | FailureKind::TransientStore | FailureKind::CommitConflict
        )
    }

    /// Whether this failure should count against the circuit breaker's
    /// failure window: schema violations and config errors are the
    /// circuit-triggering kinds. `Parse`/`Cob`/`Validation` are per-record noise any
    /// real feed produces and must not trip the breaker. A single
    /// `TransientBroker` or `TransientStore` failure is ordinary transient
    /// noise too — only once a `TransientStore` failure has exhausted its
    /// retry budget does it become "persistent" and count against the
    /// breaker; that promotion happens at the call site (see
    /// `ingest-engine::pipeline`), not here.
    pub fn trips_circuit(self) -> bool {
        matches!(self, FailureKind::Schema | FailureKind::Config)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Parse => "parse",
            FailureKind::Schema => "schema",
            FailureKind::Cob => "cob",
            FailureKind::Validation => "validation",
            FailureKind::TransientBroker => "transient_broker",
            FailureKind::TransientStore => "transient_store",
            FailureKind::CommitConflict => "commit_conflict",
            FailureKind::Config => "config",
            FailureKind::CircuitOpen => "circuit_open",
        }
    }
}

/// The error type threaded through every crate in the workspace.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("[{kind:?}] {message}")]
    Classified {
        kind: FailureKind,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        IngestError::Classified { kind, message: message.into(), source: None }
    }

    pub fn wrap(kind: FailureKind, message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        IngestError::Classified { kind, message: message.into(), source: Some(source.into()) }
    }

    /// Best-effort recovery of the failure kind, defaulting unclassified
    /// errors to `TransientStore` — the conservative choice, since treating
    /// an unknown failure as non-retriable would silently drop records while
    /// treating it as retriable merely wastes a retry slot.
    pub fn kind(&self) -> FailureKind {
        match self {
            IngestError::Classified { kind, .. } => *kind,
            _ => FailureKind::TransientStore,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
