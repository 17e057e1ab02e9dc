//! Remote command execution over SSH.
//!
//! Every shell interaction with a machine goes through [`RemoteExecutor`]:
//! command execution with captured output, a connection liveness probe,
//! and staging of the bootstrap assets. The production implementation
//! drives libssh2 sessions on a blocking thread; an executor instance is
//! owned by one provisioner, so cached sessions are scoped to the
//! machines of a single operation rather than to the process.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SshConfig;

/// Delay between dial attempts.
const DIAL_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Command used by the connection liveness probe.
const PROBE_COMMAND: &str = "uname -s";

/// SSH-level failures.
#[derive(Error, Debug)]
pub enum SshError {
    /// The machine could not be dialed within the configured attempts.
    #[error("Unable to reach '{name}' ({addr}) after {attempts} dial attempts: {cause}")]
    Unreachable {
        name: String,
        addr: String,
        attempts: u32,
        cause: String,
    },

    #[error("SSH authentication failed for '{name}': {cause}")]
    Auth { name: String, cause: String },

    /// The remote command exited non-zero; stderr is folded in.
    #[error("Command failed on '{name}' (status={status}): {stderr}")]
    Command {
        name: String,
        status: i32,
        stderr: String,
    },

    #[error("SSH transport error on '{name}': {cause}")]
    Transport { name: String, cause: String },

    #[error("Failed to stage '{path}' on '{name}': {cause}")]
    Upload {
        name: String,
        path: PathBuf,
        cause: String,
    },
}

/// Connection coordinates of one machine.
#[derive(Debug, Clone)]
pub struct SshTarget {
    /// Machine name, used as the session-cache key.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// PEM-encoded private key material.
    pub private_key: String,
}

impl SshTarget {
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Remote command surface the provisioner and machines run against.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command, returning trimmed stdout. Non-zero exit folds
    /// stderr into the error.
    async fn execute(&self, target: &SshTarget, command: &str) -> Result<String, SshError>;

    /// Establish a fresh session, run a no-op command and close it.
    async fn connection_test(&self, target: &SshTarget) -> Result<(), SshError>;

    /// Stage every regular file of `local_dir` under `remote_dir`,
    /// creating the directory first.
    async fn upload_dir(
        &self,
        target: &SshTarget,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<(), SshError>;
}

/// libssh2-backed [`RemoteExecutor`] with one cached session per machine.
pub struct SshExecutor {
    connect_timeout: Duration,
    dial_retries: u32,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl SshExecutor {
    #[must_use]
    pub fn new(config: &SshConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            dial_retries: config.dial_retries.max(1),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Dial the target and complete handshake + public-key auth.
    fn connect(
        target: &SshTarget,
        connect_timeout: Duration,
        dial_retries: u32,
    ) -> Result<Session, SshError> {
        let addr = target.addr();
        let resolved = addr
            .to_socket_addrs()
            .map_err(|e| SshError::Unreachable {
                name: target.name.clone(),
                addr: addr.clone(),
                attempts: 0,
                cause: e.to_string(),
            })?
            .next()
            .ok_or_else(|| SshError::Unreachable {
                name: target.name.clone(),
                addr: addr.clone(),
                attempts: 0,
                cause: "address resolved to nothing".to_string(),
            })?;

        let mut last_err = String::new();
        let mut stream = None;
        for attempt in 1..=dial_retries {
            match TcpStream::connect_timeout(&resolved, connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!(name = %target.name, attempt, error = %e, "dial failed");
                    last_err = e.to_string();
                    if attempt < dial_retries {
                        std::thread::sleep(DIAL_RETRY_DELAY);
                    }
                }
            }
        }
        let Some(stream) = stream else {
            return Err(SshError::Unreachable {
                name: target.name.clone(),
                addr,
                attempts: dial_retries,
                cause: last_err,
            });
        };

        let mut session = Session::new().map_err(|e| SshError::Transport {
            name: target.name.clone(),
            cause: e.to_string(),
        })?;
        session.set_tcp_stream(stream);
        session.handshake().map_err(|e| SshError::Transport {
            name: target.name.clone(),
            cause: e.to_string(),
        })?;
        session
            .userauth_pubkey_memory(&target.username, None, &target.private_key, None)
            .map_err(|e| SshError::Auth {
                name: target.name.clone(),
                cause: e.to_string(),
            })?;
        Ok(session)
    }

    /// Run one command on an established session.
    fn run(target: &SshTarget, session: &Session, command: &str) -> Result<String, SshError> {
        let transport = |e: ssh2::Error| SshError::Transport {
            name: target.name.clone(),
            cause: e.to_string(),
        };

        let mut channel = session.channel_session().map_err(transport)?;
        channel.exec(command).map_err(transport)?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| SshError::Transport {
                name: target.name.clone(),
                cause: e.to_string(),
            })?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| SshError::Transport {
                name: target.name.clone(),
                cause: e.to_string(),
            })?;
        channel.wait_close().map_err(transport)?;
        let status = channel.exit_status().map_err(transport)?;

        if status != 0 {
            return Err(SshError::Command {
                name: target.name.clone(),
                status,
                stderr: if stderr.trim().is_empty() {
                    stdout.trim().to_string()
                } else {
                    stderr.trim().to_string()
                },
            });
        }
        Ok(stdout.trim().to_string())
    }

    fn upload_file(
        target: &SshTarget,
        session: &Session,
        local: &Path,
        remote: &str,
    ) -> Result<(), SshError> {
        let upload_err = |cause: String| SshError::Upload {
            name: target.name.clone(),
            path: local.to_path_buf(),
            cause,
        };

        let contents = std::fs::read(local).map_err(|e| upload_err(e.to_string()))?;
        let mut channel = session
            .scp_send(Path::new(remote), 0o755, contents.len() as u64, None)
            .map_err(|e| upload_err(e.to_string()))?;
        channel
            .write_all(&contents)
            .map_err(|e| upload_err(e.to_string()))?;
        channel.send_eof().map_err(|e| upload_err(e.to_string()))?;
        channel.wait_eof().map_err(|e| upload_err(e.to_string()))?;
        channel.close().map_err(|e| upload_err(e.to_string()))?;
        channel
            .wait_close()
            .map_err(|e| upload_err(e.to_string()))?;
        Ok(())
    }

    /// Take the cached session for a machine, or dial a new one.
    fn checkout(
        sessions: &Mutex<HashMap<String, Session>>,
        target: &SshTarget,
        connect_timeout: Duration,
        dial_retries: u32,
    ) -> Result<Session, SshError> {
        let cached = sessions
            .lock()
            .expect("ssh session cache poisoned")
            .remove(&target.name);
        match cached {
            Some(session) => Ok(session),
            None => Self::connect(target, connect_timeout, dial_retries),
        }
    }

    fn checkin(sessions: &Mutex<HashMap<String, Session>>, name: &str, session: Session) {
        sessions
            .lock()
            .expect("ssh session cache poisoned")
            .insert(name.to_string(), session);
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, target: &SshTarget, command: &str) -> Result<String, SshError> {
        let sessions = Arc::clone(&self.sessions);
        let task_target = target.clone();
        let command = command.to_string();
        let connect_timeout = self.connect_timeout;
        let dial_retries = self.dial_retries;

        tokio::task::spawn_blocking(move || {
            debug!(name = %task_target.name, command = %command, "executing over ssh");
            let session = Self::checkout(&sessions, &task_target, connect_timeout, dial_retries)?;
            let result = Self::run(&task_target, &session, &command);
            match &result {
                // A transport failure poisons the session; drop it so the
                // next call dials again.
                Err(SshError::Transport { .. }) => {
                    warn!(name = %task_target.name, "dropping ssh session after transport error");
                }
                _ => Self::checkin(&sessions, &task_target.name, session),
            }
            result
        })
        .await
        .map_err(|e| SshError::Transport {
            name: target.name.clone(),
            cause: e.to_string(),
        })?
    }

    async fn connection_test(&self, target: &SshTarget) -> Result<(), SshError> {
        let task_target = target.clone();
        let connect_timeout = self.connect_timeout;
        let dial_retries = self.dial_retries;

        tokio::task::spawn_blocking(move || {
            let session = Self::connect(&task_target, connect_timeout, dial_retries)?;
            Self::run(&task_target, &session, PROBE_COMMAND).map(|_| ())
        })
        .await
        .map_err(|e| SshError::Transport {
            name: target.name.clone(),
            cause: e.to_string(),
        })?
    }

    async fn upload_dir(
        &self,
        target: &SshTarget,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<(), SshError> {
        let sessions = Arc::clone(&self.sessions);
        let task_target = target.clone();
        let local_dir = local_dir.to_path_buf();
        let remote_dir = remote_dir.to_string();
        let connect_timeout = self.connect_timeout;
        let dial_retries = self.dial_retries;

        tokio::task::spawn_blocking(move || {
            let session = Self::checkout(&sessions, &task_target, connect_timeout, dial_retries)?;
            let result = (|| {
                Self::run(&task_target, &session, &format!("mkdir -p {remote_dir}"))?;
                let entries = std::fs::read_dir(&local_dir).map_err(|e| SshError::Upload {
                    name: task_target.name.clone(),
                    path: local_dir.clone(),
                    cause: e.to_string(),
                })?;
                for entry in entries {
                    let entry = entry.map_err(|e| SshError::Upload {
                        name: task_target.name.clone(),
                        path: local_dir.clone(),
                        cause: e.to_string(),
                    })?;
                    let path = entry.path();
                    if !path.is_file() {
                        continue;
                    }
                    let file_name = entry.file_name();
                    let remote = format!("{remote_dir}/{}", file_name.to_string_lossy());
                    Self::upload_file(&task_target, &session, &path, &remote)?;
                }
                Ok(())
            })();
            match &result {
                Err(SshError::Transport { .. }) => {
                    warn!(name = %task_target.name, "dropping ssh session after transport error");
                }
                _ => Self::checkin(&sessions, &task_target.name, session),
            }
            result
        })
        .await
        .map_err(|e| SshError::Transport {
            name: target.name.clone(),
            cause: e.to_string(),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_addr() {
        let target = SshTarget {
            name: "worker-1".to_string(),
            host: "203.0.113.10".to_string(),
            port: 22,
            username: "cb-user".to_string(),
            private_key: String::new(),
        };
        assert_eq!(target.addr(), "203.0.113.10:22");
    }

    #[tokio::test]
    async fn test_unreachable_after_bounded_retries() {
        let executor = SshExecutor::new(&SshConfig {
            connect_timeout_secs: 1,
            dial_retries: 1,
        });
        // TEST-NET-1 address, nothing listens there.
        let target = SshTarget {
            name: "worker-1".to_string(),
            host: "192.0.2.1".to_string(),
            port: 22,
            username: "cb-user".to_string(),
            private_key: String::new(),
        };
        let err = executor.connection_test(&target).await.unwrap_err();
        assert!(matches!(err, SshError::Unreachable { attempts: 1, .. }));
    }
}
