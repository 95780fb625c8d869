//! Core session registry, per-session orchestrator, transport adapters, and
//! beacon fan-out engine for a multi-session continuous-authentication
//! daemon. A caller starts a session against a requested
//! username, drives it to completion over one of three byte-channel
//! transports, and is handed back a token once the external handshake state
//! machine reports success.
//!
//! The crate never picks an IPC transport, a handshake state machine, or a
//! radio stack — those are host-platform concerns injected through
//! [`service::HandshakeFsmBuilder`], [`service::RadioStackBuilder`], and
//! [`beacon::BeaconTransport`]. [`service::ServiceLoop`] is the single owner
//! of all session state; [`service::ServiceHandle`] is the cheap, cloneable
//! front end every caller talks to.

pub mod beacon;
pub mod channel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod lock;
pub mod orchestrator;
pub mod pairing;
pub mod registry;
pub mod service;
pub mod session;
pub mod userlist;

pub use config::{ChannelType, ConfigOverlay};
pub use error::{BeaconError, ChannelError, ConfigError, CoreError, OrchestratorError, RegistryError};
pub use registry::SessionRegistry;
pub use service::{DaemonApi, ServiceConfig, ServiceHandle, ServiceLoop};
pub use session::{AuthStatus, Session, SessionState, UserRecord};
