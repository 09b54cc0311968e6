//! Remote shell adapter
//!
//! Authenticated session setup with exponential-backoff retries (post-boot
//! services take a while to accept connections), command execution with
//! per-command timeouts, and idempotent teardown. The transport library is
//! behind the [`SessionFactory`] / [`RemoteSession`] seam so tests inject
//! scripted sessions.

mod transport;

pub use transport::Ssh2Factory;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::SshError;
use crate::models::CommandOutcome;

/// One active authenticated session, exclusively owned by its caller.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run one command. Non-zero exit codes are not transport failures;
    /// the outcome classification carries the distinction.
    async fn exec(&mut self, command: &str, timeout: Duration) -> CommandOutcome;

    /// Tear the session down. Safe to call on a session the server side
    /// already invalidated.
    async fn close(&mut self);
}

/// Opens sessions against a host.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, host: &str, username: &str) -> Result<Box<dyn RemoteSession>, SshError>;
}

/// Connection retry policy.
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(10),
        }
    }
}

/// The remote shell adapter (C2).
pub struct ShellAdapter {
    factory: Arc<dyn SessionFactory>,
    policy: ConnectPolicy,
}

impl ShellAdapter {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            policy: ConnectPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ConnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Connect with the adapter's default retry policy.
    pub async fn connect(
        &self,
        host: &str,
        username: &str,
    ) -> Result<Box<dyn RemoteSession>, SshError> {
        self.connect_with(host, username, self.policy.max_attempts, self.policy.initial_backoff)
            .await
    }

    /// Connect with an explicit retry budget. Authentication failures are
    /// not retried; everything else backs off exponentially.
    pub async fn connect_with(
        &self,
        host: &str,
        username: &str,
        max_attempts: u32,
        initial_backoff: Duration,
    ) -> Result<Box<dyn RemoteSession>, SshError> {
        let mut backoff = initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            info!(
                host = %host,
                username = %username,
                attempt = attempt,
                max_attempts = max_attempts,
                "Attempting ssh connection"
            );

            match self.factory.open(host, username).await {
                Ok(session) => {
                    info!(host = %host, "Ssh connection established");
                    return Ok(session);
                }
                Err(error @ SshError::Auth { .. }) => return Err(error),
                Err(error @ SshError::KeyFileMissing(_)) => return Err(error),
                Err(error) => {
                    last_error = error.to_string();
                    if attempt < max_attempts {
                        warn!(
                            host = %host,
                            attempt = attempt,
                            backoff_secs = backoff.as_secs(),
                            error = %last_error,
                            "Connection attempt failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(SshError::Exhausted {
            host: host.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}

/// Warn when the private key file is readable beyond its owner. The key
/// bytes themselves never pass through this crate's logs.
pub fn check_key_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode() & 0o777;
    if mode != 0o600 && mode != 0o400 {
        warn!(
            path = %path.display(),
            mode = format!("{mode:o}"),
            "Private key file permissions are overly permissive; recommended 0600 or 0400"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedFactory {
        failures_before_success: AtomicU32,
        auth_failure: bool,
    }

    struct NoopSession;

    #[async_trait]
    impl RemoteSession for NoopSession {
        async fn exec(&mut self, _command: &str, _timeout: Duration) -> CommandOutcome {
            CommandOutcome::from_exit(0, String::new(), String::new())
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl SessionFactory for ScriptedFactory {
        async fn open(
            &self,
            host: &str,
            username: &str,
        ) -> Result<Box<dyn RemoteSession>, SshError> {
            if self.auth_failure {
                return Err(SshError::Auth {
                    host: host.to_string(),
                    username: username.to_string(),
                });
            }
            if self.failures_before_success.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(SshError::Transport("connection refused".into()));
            }
            Ok(Box::new(NoopSession))
        }
    }

    #[tokio::test]
    async fn test_connect_retries_transport_errors() {
        let adapter = ShellAdapter::new(Arc::new(ScriptedFactory {
            failures_before_success: AtomicU32::new(2),
            auth_failure: false,
        }));

        let session = adapter
            .connect_with("10.0.1.5", "ec2-user", 5, Duration::from_millis(1))
            .await;
        assert!(session.is_ok());
    }

    #[tokio::test]
    async fn test_connect_exhausts_budget() {
        let adapter = ShellAdapter::new(Arc::new(ScriptedFactory {
            failures_before_success: AtomicU32::new(100),
            auth_failure: false,
        }));

        let error = adapter
            .connect_with("10.0.1.5", "ec2-user", 3, Duration::from_millis(1))
            .await
            .unwrap_err();
        match error {
            SshError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected exhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let adapter = ShellAdapter::new(Arc::new(ScriptedFactory {
            failures_before_success: AtomicU32::new(0),
            auth_failure: true,
        }));

        let error = adapter
            .connect_with("10.0.1.5", "ec2-user", 5, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(error, SshError::Auth { .. }));
    }
}
