//! `sshd` binary: a thin wrapper around [`sshd_core`] reading its
//! configuration from environment variables, the way the teacher's Tauri
//! app wires `init_logging` + config-from-disk in its own `main`. No CLI
//! parsing, no daemonisation, no PID file (SPEC_FULL.md Non-goals) - just
//! host-identity derivation, auth-descriptor selection, and the accept
//! loop.

use std::path::PathBuf;
use std::sync::Arc;

use sshd_core::config::{AuthDescriptor, ListenAddr, ServerConfigBuilder};
use sshd_core::keygen::{HostIdentity, KeyAlgorithm};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn env_listen_addr() -> ListenAddr {
    if let Ok(path) = std::env::var("SSHD_UNIX_SOCKET") {
        return ListenAddr::UnixSocket { path: PathBuf::from(path) };
    }
    let host = std::env::var("SSHD_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("SSHD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(2222);
    ListenAddr::Tcp { host, port }
}

fn env_auth() -> AuthDescriptor {
    match (std::env::var("SSHD_AUTH_USER"), std::env::var("SSHD_AUTH_PASSWORD")) {
        (Ok(user), Ok(pass)) => AuthDescriptor::Password { user, pass },
        _ => AuthDescriptor::None,
    }
}

fn env_key_algorithm() -> KeyAlgorithm {
    match std::env::var("SSHD_KEY_ALGORITHM").as_deref() {
        Ok("rsa2048") => KeyAlgorithm::Rsa2048,
        _ => KeyAlgorithm::Ed25519,
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    let seed = std::env::var("SSHD_HOST_SEED").unwrap_or_else(|_| "sshd-core-default-seed".to_string());
    let host_identity = match HostIdentity::from_seed(&seed, env_key_algorithm()) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::error!(error = %e, "failed to derive host identity");
            std::process::exit(1);
        }
    };
    tracing::info!(fingerprint = host_identity.fingerprint(), "host identity derived");

    let shell_path = std::env::var("SSHD_SHELL").unwrap_or_else(|_| "/bin/bash".to_string());

    let config = ServerConfigBuilder::new(env_listen_addr(), shell_path, host_identity)
        .auth(env_auth())
        .build();

    let config = match config {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = sshd_core::listener::serve(config).await {
        tracing::error!(error = %e, "server exited");
        std::process::exit(1);
    }
}
