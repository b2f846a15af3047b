//! Session runtime driven through an external command.
//!
//! The command must understand three subcommands:
//!
//! ```text
//! <cmd> sessions ensure --key <key> --model <model>
//! <cmd> sessions send   --key <key> --idempotency-key <id>    (task on stdin)
//! <cmd> sessions list   --json                                 (JSON on stdout)
//! ```
//!
//! `list` may print either an array of keys or an array of objects with a
//! `key` field.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::SessionRuntime;
use crate::errors::ProviderError;

const PROVIDER: &str = "runtime";

/// Exit code a runtime uses for a retryable failure.
pub const EXIT_TRANSIENT: i32 = 75;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListedSession {
    Key(String),
    Entry {
        key: String,
        #[serde(default = "alive_default")]
        alive: bool,
    },
}

fn alive_default() -> bool {
    true
}

/// Parse `sessions list --json` output.
pub fn parse_session_list(stdout: &str) -> Result<HashSet<String>, ProviderError> {
    let listed: Vec<ListedSession> = serde_json::from_str(stdout.trim()).map_err(|e| {
        ProviderError::permanent(PROVIDER, format!("unreadable session list: {}", e))
    })?;
    Ok(listed
        .into_iter()
        .filter_map(|s| match s {
            ListedSession::Key(key) => Some(key),
            ListedSession::Entry { key, alive } => alive.then_some(key),
        })
        .collect())
}

pub struct CommandRuntime {
    command: String,
}

impl CommandRuntime {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String, ProviderError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ProviderError::permanent(
                    PROVIDER,
                    format!("runtime command '{}' not found", self.command),
                )
            } else {
                ProviderError::transient(PROVIDER, format!("failed to spawn '{}': {}", self.command, e))
            }
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| ProviderError::transient(PROVIDER, format!("write stdin: {}", e)))?;
            pipe.shutdown()
                .await
                .map_err(|e| ProviderError::transient(PROVIDER, format!("close stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProviderError::transient(PROVIDER, format!("wait: {}", e)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = format!("{} {} failed: {}", self.command, args.join(" "), stderr);
        Err(match output.status.code() {
            Some(EXIT_TRANSIENT) | None => ProviderError::transient(PROVIDER, message),
            Some(_) => ProviderError::permanent(PROVIDER, message),
        })
    }
}

#[async_trait]
impl SessionRuntime for CommandRuntime {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn ensure_session(&self, key: &str, model: &str) -> Result<(), ProviderError> {
        self.run(&["sessions", "ensure", "--key", key, "--model", model], None)
            .await
            .map(|_| ())
    }

    async fn deliver_task(
        &self,
        key: &str,
        payload: &str,
        idempotency_key: &str,
    ) -> Result<(), ProviderError> {
        self.run(
            &[
                "sessions",
                "send",
                "--key",
                key,
                "--idempotency-key",
                idempotency_key,
            ],
            Some(payload),
        )
        .await
        .map(|_| ())
    }

    async fn list_alive_sessions(&self) -> Result<HashSet<String>, ProviderError> {
        let stdout = self.run(&["sessions", "list", "--json"], None).await?;
        parse_session_list(&stdout)
    }
}
