//! Blocking ssh2 transport driven from the async runtime

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{check_key_permissions, RemoteSession, SessionFactory};
use crate::error::SshError;
use crate::models::CommandOutcome;

const SSH_PORT: u16 = 22;

// libssh2 session error codes the classifier cares about.
const ERROR_TIMEOUT: i32 = -9;
const ERROR_PUBKEY_UNVERIFIED: i32 = -16;
const ERROR_AUTHENTICATION_FAILED: i32 = -18;

/// Opens key-authenticated ssh2 sessions.
pub struct Ssh2Factory {
    key_path: PathBuf,
    connect_timeout: Duration,
}

impl Ssh2Factory {
    pub fn new(key_path: impl Into<PathBuf>) -> Result<Self, SshError> {
        let key_path = key_path.into();
        if !key_path.exists() {
            return Err(SshError::KeyFileMissing(key_path));
        }
        check_key_permissions(&key_path);
        Ok(Self {
            key_path,
            connect_timeout: Duration::from_secs(30),
        })
    }
}

#[async_trait]
impl SessionFactory for Ssh2Factory {
    async fn open(&self, host: &str, username: &str) -> Result<Box<dyn RemoteSession>, SshError> {
        let host = host.to_string();
        let username = username.to_string();
        let key_path = self.key_path.clone();
        let timeout = self.connect_timeout;

        let session = tokio::task::spawn_blocking(move || {
            open_blocking(&host, &username, &key_path, timeout)
        })
        .await
        .map_err(|error| SshError::Transport(format!("connect task failed: {error}")))??;

        Ok(Box::new(session))
    }
}

fn open_blocking(
    host: &str,
    username: &str,
    key_path: &Path,
    timeout: Duration,
) -> Result<Ssh2Session, SshError> {
    let address = (host, SSH_PORT)
        .to_socket_addrs()
        .map_err(|error| SshError::Transport(format!("resolve {host}: {error}")))?
        .next()
        .ok_or_else(|| SshError::Transport(format!("no address for {host}")))?;

    let tcp = TcpStream::connect_timeout(&address, timeout)
        .map_err(|error| SshError::Transport(format!("connect {address}: {error}")))?;

    let mut session = ssh2::Session::new()
        .map_err(|error| SshError::Transport(format!("session init: {error}")))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|error| SshError::Transport(format!("handshake: {error}")))?;

    session
        .userauth_pubkey_file(username, None, key_path, None)
        .map_err(|error| match error.code() {
            ssh2::ErrorCode::Session(ERROR_AUTHENTICATION_FAILED)
            | ssh2::ErrorCode::Session(ERROR_PUBKEY_UNVERIFIED) => SshError::Auth {
                host: host.to_string(),
                username: username.to_string(),
            },
            _ => SshError::Transport(format!("authentication: {error}")),
        })?;

    if !session.authenticated() {
        return Err(SshError::Auth {
            host: host.to_string(),
            username: username.to_string(),
        });
    }

    debug!(host = %host, "ssh2 session established");
    Ok(Ssh2Session {
        inner: Arc::new(Mutex::new(session)),
    })
}

/// One live ssh2 session. The blocking library is only ever touched from
/// `spawn_blocking` tasks; the mutex makes the handle movable across them.
pub struct Ssh2Session {
    inner: Arc<Mutex<ssh2::Session>>,
}

#[async_trait]
impl RemoteSession for Ssh2Session {
    async fn exec(&mut self, command: &str, timeout: Duration) -> CommandOutcome {
        let inner = Arc::clone(&self.inner);
        let command = command.to_string();

        match tokio::task::spawn_blocking(move || exec_blocking(&inner, &command, timeout)).await
        {
            Ok(outcome) => outcome,
            Err(error) => CommandOutcome::transport(format!("exec task failed: {error}")),
        }
    }

    async fn close(&mut self) {
        let inner = Arc::clone(&self.inner);
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(session) = inner.lock() {
                // Best effort; the server side may already be gone.
                let _ = session.disconnect(None, "closing", None);
            }
        })
        .await;
    }
}

fn exec_blocking(
    inner: &Mutex<ssh2::Session>,
    command: &str,
    timeout: Duration,
) -> CommandOutcome {
    let session = match inner.lock() {
        Ok(session) => session,
        Err(_) => return CommandOutcome::transport("session lock poisoned"),
    };

    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);

    let mut channel = match session.channel_session() {
        Ok(channel) => channel,
        Err(error) => return classify_ssh2_error(&error, String::new(), String::new()),
    };
    if let Err(error) = channel.exec(command) {
        return classify_ssh2_error(&error, String::new(), String::new());
    }

    let mut stdout = String::new();
    let mut stderr = String::new();
    if let Err(error) = channel.read_to_string(&mut stdout) {
        let _ = channel.stderr().read_to_string(&mut stderr);
        return classify_io_error(&error, stdout, stderr);
    }
    if let Err(error) = channel.stderr().read_to_string(&mut stderr) {
        return classify_io_error(&error, stdout, stderr);
    }

    let _ = channel.wait_close();
    let exit_code = channel.exit_status().unwrap_or(-1);
    CommandOutcome::from_exit(exit_code, stdout, stderr)
}

fn classify_ssh2_error(error: &ssh2::Error, stdout: String, stderr: String) -> CommandOutcome {
    if matches!(error.code(), ssh2::ErrorCode::Session(ERROR_TIMEOUT)) {
        CommandOutcome::timeout(stdout, stderr)
    } else {
        CommandOutcome::transport(error)
    }
}

fn classify_io_error(error: &std::io::Error, stdout: String, stderr: String) -> CommandOutcome {
    match error.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            CommandOutcome::timeout(stdout, stderr)
        }
        _ => CommandOutcome::transport(error),
    }
}
