//! Error and status enumerations.
//!
//! Three kinds of failure propagate through the library:
//!
//! - [`ProviderStatus`] values are returned verbatim from provider calls.
//! - [`ClientError`] values are per-session and stored on the client state
//!   until the session returns through its idle cycle.
//! - Invariant violations (illegal state transitions, duplicate streaming
//!   keys, clearing a non-success error, provider use before load) are fatal:
//!   the library panics with a `"<component>: Unallowed ..."` message and the
//!   process is expected to terminate.

use std::fmt;

use thiserror::Error;

/// Status codes returned by the group-communication provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Success,
    /// Operation succeeded with a warning attached to the provider log.
    Warning,
    /// The referenced transaction is not known to the provider.
    TrxMissing,
    /// Certification failed; the transaction must roll back.
    CertFailed,
    /// The transaction was brute-force aborted by a high-priority applier.
    BfAbort,
    /// Write set exceeded the configured maximum size.
    SizeExceeded,
    /// Not connected to the group.
    ConnectionFailed,
    /// Operation not allowed in the current provider state.
    NotAllowed,
    /// Unrecoverable provider failure.
    Fatal,
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderStatus::Success => "success",
            ProviderStatus::Warning => "warning",
            ProviderStatus::TrxMissing => "transaction missing",
            ProviderStatus::CertFailed => "certification failed",
            ProviderStatus::BfAbort => "brute-force aborted",
            ProviderStatus::SizeExceeded => "size exceeded",
            ProviderStatus::ConnectionFailed => "connection failed",
            ProviderStatus::NotAllowed => "not allowed",
            ProviderStatus::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Per-session client error, absorbed by the command hooks and surfaced to
/// the DBMS at the next statement boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientError {
    #[default]
    Success,
    /// The transaction was aborted due to a conflict; maps to the DBMS
    /// deadlock error.
    Deadlock,
    Interrupted,
    SizeExceeded,
    /// Appending a streaming fragment failed.
    AppendFragment,
    ErrorDuringCommit,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientError::Success => "success",
            ClientError::Deadlock => "deadlock",
            ClientError::Interrupted => "interrupted",
            ClientError::SizeExceeded => "size exceeded",
            ClientError::AppendFragment => "append fragment",
            ClientError::ErrorDuringCommit => "error during commit",
        };
        write!(f, "{s}")
    }
}

/// Library error returned by fallible coordination operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("provider not loaded")]
    ProviderNotLoaded,

    #[error("provider call failed: {0}")]
    Provider(ProviderStatus),

    #[error("operation timed out")]
    Timeout,

    /// State snapshot transfer failed with the embedder-reported code.
    #[error("state snapshot transfer failed: {0}")]
    Sst(i32),
}

impl From<ProviderStatus> for Error {
    fn from(status: ProviderStatus) -> Self {
        Error::Provider(status)
    }
}
