//! Minimal CLI-driven front end for the continuous-authentication core.
//!
//! The core never picks an IPC broker, a handshake state machine, or a radio
//! stack: those are host-platform concerns injected
//! through [`ServiceConfig`]. This binary wires in stand-ins for all three so
//! the service loop, session registry, and transport adapters can be driven
//! end to end from a terminal, and exercises [`DaemonApi`] over a
//! line-oriented stdin protocol instead of a real IPC broker — a real
//! deployment replaces stdin with whatever bus/IPC framing the host provides
//! and the fsm/radio builders with the platform's real collaborators.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use continuauth_core::beacon::BeaconTransport;
use continuauth_core::channel::attr::RadioStack;
use continuauth_core::error::{BeaconError, ChannelError, ConfigError};
use continuauth_core::handshake::{HandshakeCallbacks, HandshakeFsm};
use continuauth_core::service::{DaemonApi, HandshakeFsmBuilder, RadioStackBuilder, ServiceConfig, ServiceLoop};
use continuauth_core::session::{AuthStatus, UserRecord};

#[derive(Parser, Debug)]
#[command(name = "continuauthd", about = "Multi-session continuous-authentication daemon core")]
struct Args {
    /// Directory holding service-public-key, service-private-key, users.txt, bluetooth.txt, config.txt
    #[arg(long, default_value = "/etc/continuauth/")]
    config_dir: String,

    /// Shell command invoked as `<lock-command> <username>`
    #[arg(long, default_value = "/bin/true")]
    lock_command: String,

    /// Identity string embedded in `StreamChannel` addresses
    #[arg(long, default_value = "localhost")]
    host_identity: String,

    /// Wall-clock watchdog duration layered over long-poll reads
    #[arg(long, default_value_t = 30)]
    watchdog_seconds: u64,

    /// Service display name carried in the beacon payload
    #[arg(long, default_value = "continuauth")]
    service_name: String,
}

/// Stand-in for the host bus/radio management daemon: logs each
/// push instead of actually locating or writing to a nearby device. Replace
/// with a real transport before advertising to anything.
struct LoggingBeaconTransport;

#[async_trait]
impl BeaconTransport for LoggingBeaconTransport {
    async fn locate(&self, target: &str) -> Result<(), BeaconError> {
        info!(%target, "beacon: would locate target (demo transport)");
        Ok(())
    }

    async fn connect_and_write(&self, target: &str, payload: &[u8]) -> Result<(), BeaconError> {
        info!(%target, bytes = payload.len(), "beacon: would push payload (demo transport)");
        Ok(())
    }
}

/// Stand-in for the host radio daemon an `AttrChannel` session drives.
/// Acknowledges every call without touching any real radio.
struct LoggingRadioStack;

#[async_trait]
impl RadioStack for LoggingRadioStack {
    async fn initialise(&mut self, service_uuid: [u8; 16]) -> Result<(), ChannelError> {
        info!(uuid = %hex(&service_uuid), "radio: initialise (demo stack)");
        Ok(())
    }

    async fn start_advertising(&mut self, continuous: bool) -> Result<(), ChannelError> {
        info!(continuous, "radio: start advertising (demo stack)");
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<(), ChannelError> {
        info!("radio: stop advertising (demo stack)");
        Ok(())
    }

    async fn finalise(&mut self) -> Result<(), ChannelError> {
        info!("radio: finalise (demo stack)");
        Ok(())
    }

    async fn notify(&mut self, chunk: &[u8]) -> Result<(), ChannelError> {
        info!(bytes = chunk.len(), "radio: notify chunk (demo stack)");
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

struct LoggingRadioStackBuilder;

impl RadioStackBuilder for LoggingRadioStackBuilder {
    fn build(&self) -> Box<dyn RadioStack> {
        Box::new(LoggingRadioStack)
    }
}

/// Stand-in for the external handshake state machine: logs
/// transport-side events and never authenticates anyone on its own. A real
/// deployment supplies the actual cryptographic handshake here; this stub
/// only proves the orchestrator wiring reaches the fsm boundary correctly.
struct LoggingFsm {
    handle: i32,
    callbacks: Arc<dyn HandshakeCallbacks>,
}

#[async_trait]
impl HandshakeFsm for LoggingFsm {
    async fn start(&mut self, allowed_users: Vec<UserRecord>) {
        info!(handle = self.handle, users = allowed_users.len(), "fsm: start (demo fsm, never authenticates)");
    }

    async fn connected(&mut self) {
        info!(handle = self.handle, "fsm: peer connected");
        self.callbacks.on_status_updated("awaiting real handshake implementation".to_string()).await;
    }

    async fn read(&mut self, bytes: Vec<u8>) {
        info!(handle = self.handle, len = bytes.len(), "fsm: read (demo fsm discards payload)");
    }

    async fn disconnected(&mut self) {
        info!(handle = self.handle, "fsm: peer disconnected");
        self.callbacks.on_authenticated(AuthStatus::Failed, String::new(), Vec::new()).await;
    }

    async fn timeout(&mut self) {
        warn!(handle = self.handle, "fsm: timeout");
        self.callbacks.on_error().await;
    }

    async fn stop(&mut self) {
        info!(handle = self.handle, "fsm: stop requested");
        self.callbacks.on_session_ended().await;
    }
}

struct LoggingFsmBuilder {
    next_handle: std::sync::atomic::AtomicI32,
}

impl HandshakeFsmBuilder for LoggingFsmBuilder {
    fn build(&self, callbacks: Arc<dyn HandshakeCallbacks>) -> Box<dyn HandshakeFsm> {
        let handle = self.next_handle.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Box::new(LoggingFsm { handle, callbacks })
    }
}

#[tokio::main]
async fn main() -> Result<(), ConfigError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = ServiceConfig {
        base_config_dir: normalize(&args.config_dir),
        lock_command: args.lock_command,
        host_identity: args.host_identity,
        watchdog_duration: Duration::from_secs(args.watchdog_seconds),
        service_name: args.service_name,
        beacon_transport: Arc::new(LoggingBeaconTransport),
        fsm_builder: Arc::new(LoggingFsmBuilder { next_handle: std::sync::atomic::AtomicI32::new(0) }),
        radio_stack_builder: Some(Arc::new(LoggingRadioStackBuilder)),
    };

    let (service_loop, handle) = ServiceLoop::new(config)?;
    let loop_task = tokio::spawn(service_loop.run());

    info!("continuauthd ready; commands: start <user> <json-params> | complete <handle> | ownerlost <tag> | exit");
    run_stdin_repl(handle).await;

    let _ = loop_task.await;
    Ok(())
}

fn normalize(dir: &str) -> String {
    if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{dir}/")
    }
}

/// Drives [`DaemonApi`] from stdin lines, standing in for whatever IPC
/// broker framing a real deployment would use — that framing is this
/// core's concern to consume, not to define.
async fn run_stdin_repl(handle: impl DaemonApi) {
    let stdin = io::stdin();
    print_prompt();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            print_prompt();
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        match parts.next() {
            Some("start") => {
                let user = parts.next().unwrap_or("").to_string();
                let params = parts.next().unwrap_or("{}").to_string();
                let (h, code, ok) = handle.start_auth(user, params, Some("stdin-repl".to_string())).await;
                println!("handle={h} code={code} ok={ok}");
            }
            Some("complete") => {
                match parts.next().unwrap_or("").parse::<i32>() {
                    Ok(h) => {
                        let (user, token, ok) = handle.complete_auth(h).await;
                        println!("user={user} token={token} ok={ok}");
                    }
                    Err(_) => println!("usage: complete <handle>"),
                }
            }
            Some("ownerlost") => {
                let tag = parts.next().unwrap_or("").to_string();
                handle.owner_lost(tag).await;
                println!("ok");
            }
            Some("exit") => {
                handle.exit().await;
                break;
            }
            _ => println!("unknown command"),
        }
        print_prompt();
    }
}

fn print_prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}
