//! `smuxd` binary: a thin wrapper building a [`sshd_core::smux::SmuxConfig`]
//! from environment variables and calling into the library. It does not
//! fork or manage a PID file; it does perform the control-socket path
//! resolution with fallback (`listener::resolve_smux_socket_path`).

use std::path::PathBuf;
use std::sync::Arc;

use sshd_core::keygen::{HostIdentity, KeyAlgorithm};
use sshd_core::listener::resolve_smux_socket_path;
use sshd_core::shell::Shell;
use sshd_core::smux::{SessionRegistry, SmuxConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn env_listen_addr() -> sshd_core::config::ListenAddr {
    if let Ok(path) = std::env::var("SMUXD_UNIX_SOCKET") {
        return sshd_core::config::ListenAddr::UnixSocket { path: PathBuf::from(path) };
    }
    sshd_core::config::ListenAddr::UnixSocket { path: resolve_smux_socket_path() }
}

fn env_key_algorithm() -> KeyAlgorithm {
    match std::env::var("SMUXD_KEY_ALGORITHM").as_deref() {
        Ok("rsa2048") => KeyAlgorithm::Rsa2048,
        _ => KeyAlgorithm::Ed25519,
    }
}

fn env_auth_provider() -> std::sync::Arc<dyn sshd_core::auth::AuthProvider> {
    match (std::env::var("SMUXD_AUTH_USER"), std::env::var("SMUXD_AUTH_PASSWORD")) {
        (Ok(user), Ok(pass)) => std::sync::Arc::new(sshd_core::auth::PasswordAuth { user, password: pass }),
        _ => std::sync::Arc::new(sshd_core::auth::NoAuth),
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    let seed = std::env::var("SMUXD_HOST_SEED").unwrap_or_else(|_| "smuxd-core-default-seed".to_string());
    let host_identity = match HostIdentity::from_seed(&seed, env_key_algorithm()) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::error!(error = %e, "failed to derive host identity");
            std::process::exit(1);
        }
    };
    tracing::info!(fingerprint = host_identity.fingerprint(), "smux host identity derived");

    let shell_path = std::env::var("SMUXD_SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
    let shell = match Shell::resolve(shell_path) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "invalid smux shell configuration");
            std::process::exit(1);
        }
    };
    let initial_cwd = std::env::var("SMUXD_INITIAL_CWD").ok().map(PathBuf::from);

    let ws_listen_addr = std::env::var("SMUXD_WS_LISTEN")
        .ok()
        .and_then(|s| s.parse().ok());
    let ws_token_ttl = std::time::Duration::from_secs(
        std::env::var("SMUXD_WS_TOKEN_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300),
    );
    let keepalive_interval = std::time::Duration::from_secs(
        std::env::var("SMUXD_KEEPALIVE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30),
    );

    let config = Arc::new(SmuxConfig {
        listen_addr: env_listen_addr(),
        shell: shell.clone(),
        initial_cwd: initial_cwd.clone(),
        host_identity,
        auth_provider: env_auth_provider(),
        keepalive_interval,
        ws_listen_addr,
        ws_token_ttl,
    });

    let registry = Arc::new(SessionRegistry::new(shell, initial_cwd));

    if let Some(ws_addr) = config.ws_listen_addr {
        let ws_registry = registry.clone();
        let token = sshd_core::smux::viewer_ws::generate_token();
        tracing::info!(token = %token, "smux websocket viewer token (share with the client out-of-band)");
        let token: std::sync::Arc<str> = std::sync::Arc::from(token.as_str());
        let ws_token_ttl = config.ws_token_ttl;
        tokio::spawn(async move {
            if let Err(e) = sshd_core::smux::viewer_ws::serve(ws_addr, ws_registry, token, ws_token_ttl).await {
                tracing::error!(error = %e, "websocket viewer transport exited");
            }
        });
    }

    if let Err(e) = sshd_core::smux::control::serve(config, registry).await {
        tracing::error!(error = %e, "smuxd exited");
        std::process::exit(1);
    }
}
