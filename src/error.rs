//! Error taxonomy for the continuous-authentication core.
//!
//! Each subsystem owns a narrow `thiserror` enum; [`CoreError`] composes them
//! for callers that cross component boundaries (mainly the service loop).

use thiserror::Error;

/// Errors raised while building or overlaying a [`crate::config::ConfigOverlay`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file is not a well-formed JSON object")]
    Malformed,
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("caller-supplied parameters are not a well-formed JSON object")]
    CallerMalformed,
}

/// Errors raised by [`crate::registry::SessionRegistry`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no free session slot")]
    Exhausted,
    #[error("unknown session handle")]
    UnknownHandle,
}

/// Errors surfaced by a [`crate::channel::ByteChannel`] implementation.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no endpoint could be bound")]
    BindFailed,
    #[error("a send is already outstanding on this channel")]
    Busy,
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("fatal transport failure: {0}")]
    Fatal(String),
    #[error("wall-clock watchdog expired on an in-flight read")]
    WatchdogExpired,
}

/// Errors raised while driving a [`crate::beacon::BeaconEmitter`] campaign.
#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("beacon target list is empty")]
    NoTargets,
    #[error("campaign already running")]
    AlreadyRunning,
}

/// Errors raised by [`crate::orchestrator::SessionOrchestrator`].
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("requested user has no matching credentials")]
    FilterEmpty,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Beacon(#[from] BeaconError),
    #[error("handshake reported a protocol error: {0}")]
    Handshake(String),
}

/// Top-level error returned across crate boundaries.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Beacon(#[from] BeaconError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}
