// ABOUTME: Command backend - runs an external program once per query.
// ABOUTME: Stdout becomes the answer; streamed execution emits one text chunk per stdout line.

use crate::capabilities::{AgentCapabilities, Capability};
use crate::context::AgentContext;
use crate::health::HealthStatus;
use crate::response::AgentOutput;
use crate::stream::ChunkSink;
use crate::traits::{AgentBackend, AgentConfig};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as ProcessCommand};

/// How the query reaches the child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryInput {
    /// Appended as the last argument
    #[default]
    Arg,
    /// Written to stdin, which is then closed
    Stdin,
}

/// Configuration for the command backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Program to run, either a path or a name looked up on PATH
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Kill the child if it runs longer than this
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub pass_query_via: QueryInput,
}

impl CommandConfig {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout_secs: None,
            pass_query_via: QueryInput::Arg,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stdin(mut self) -> Self {
        self.pass_query_via = QueryInput::Stdin;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }
}

pub struct CommandBackend {
    config: CommandConfig,
    capabilities: AgentCapabilities,
}

impl CommandBackend {
    pub fn new(config: CommandConfig) -> Result<Self> {
        if config.binary.trim().is_empty() {
            bail!("binary must not be empty");
        }
        Ok(Self {
            config,
            capabilities: AgentCapabilities::from_set([Capability::Streaming]),
        })
    }

    /// Build from a configuration map
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let cfg: CommandConfig = serde_json::from_value(serde_json::Value::Object(config.clone()))
            .context("invalid command backend configuration")?;
        Self::new(cfg)
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    fn spawn(&self, query: &str) -> Result<Child> {
        let mut cmd = ProcessCommand::new(&self.config.binary);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match self.config.pass_query_via {
            QueryInput::Arg => {
                cmd.arg(query).stdin(Stdio::null());
            }
            QueryInput::Stdin => {
                cmd.stdin(Stdio::piped());
            }
        }
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(binary = %self.config.binary, args = ?self.config.args, "Spawning command backend");

        cmd.spawn()
            .with_context(|| format!("failed to spawn '{}'", self.config.binary))
    }

    async fn feed_stdin(&self, child: &mut Child, query: &str) -> Result<()> {
        if self.config.pass_query_via == QueryInput::Stdin {
            let mut stdin = child.stdin.take().context("failed to capture stdin")?;
            stdin.write_all(query.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.config.timeout_secs.map(Duration::from_secs)
    }

    async fn run_to_completion(&self, query: &str) -> Result<String> {
        let mut child = self.spawn(query)?;
        self.feed_stdin(&mut child, query).await?;

        let mut stdout = child.stdout.take().context("failed to capture stdout")?;
        let mut stderr = child.stderr.take().context("failed to capture stderr")?;

        let run = async {
            let mut out = String::new();
            let mut err = String::new();
            let (read_out, read_err) =
                tokio::join!(stdout.read_to_string(&mut out), stderr.read_to_string(&mut err));
            read_out?;
            read_err?;
            let status = child.wait().await?;
            Ok::<_, anyhow::Error>((status, out, err))
        };

        let (status, out, err) = match self.timeout() {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .with_context(|| format!("'{}' timed out after {:?}", self.config.binary, limit))??,
            None => run.await?,
        };

        check_exit(&self.config.binary, status, &err)?;
        Ok(out.trim_end().to_string())
    }

    async fn stream_lines(&self, query: &str, sink: &mut ChunkSink) -> Result<()> {
        let mut child = self.spawn(query)?;
        self.feed_stdin(&mut child, query).await?;

        let stdout = child.stdout.take().context("failed to capture stdout")?;
        let mut stderr = child.stderr.take().context("failed to capture stderr")?;

        // Drain stderr concurrently so a chatty child cannot block on a full pipe
        let stderr_handle = tokio::spawn(async move {
            let mut err = String::new();
            let _ = stderr.read_to_string(&mut err).await;
            err
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut emitted = false;
        while let Some(line) = lines.next_line().await? {
            let text = if emitted { format!("\n{}", line) } else { line };
            emitted = true;
            if sink.text(text).await.is_err() {
                tracing::debug!(binary = %self.config.binary, "Chunk consumer gone, stopping command");
                stderr_handle.abort();
                return Ok(());
            }
        }

        let status = child.wait().await?;
        let err = match stderr_handle.await {
            Ok(err) => err,
            Err(e) => {
                tracing::warn!(error = %e, "stderr reader task failed to complete");
                String::new()
            }
        };
        check_exit(&self.config.binary, status, &err)?;

        sink.complete_with_transcript().await?;
        Ok(())
    }
}

fn check_exit(binary: &str, status: ExitStatus, stderr: &str) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        tracing::warn!(binary = %binary, stderr = %stderr, "Command backend stderr");
    }
    match status.code() {
        Some(code) if stderr.is_empty() => bail!("'{}' exited with status {}", binary, code),
        Some(code) => bail!("'{}' exited with status {}: {}", binary, code, stderr),
        None => bail!("'{}' terminated by signal", binary),
    }
}

/// Locate `binary` the way a shell would: paths are checked directly, bare
/// names are searched on PATH.
pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    if binary.contains(std::path::MAIN_SEPARATOR) || binary.contains('/') {
        let path = PathBuf::from(binary);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[async_trait]
impl AgentBackend for CommandBackend {
    fn kind(&self) -> &'static str {
        "command"
    }

    fn capabilities(&self) -> AgentCapabilities {
        self.capabilities.clone()
    }

    async fn execute(&mut self, query: &str, context: &AgentContext) -> Result<AgentOutput> {
        let started = Instant::now();
        let answer = self.run_to_completion(query).await?;
        tracing::debug!(
            binary = %self.config.binary,
            session_id = %context.session_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            answer_len = answer.len(),
            "Command backend finished"
        );
        Ok(AgentOutput::text(answer).with_metadata("binary", json!(self.config.binary)))
    }

    async fn stream(
        &mut self,
        query: &str,
        _context: &AgentContext,
        sink: &mut ChunkSink,
    ) -> Result<()> {
        match self.timeout() {
            Some(limit) => tokio::time::timeout(limit, self.stream_lines(query, sink))
                .await
                .with_context(|| format!("'{}' timed out after {:?}", self.config.binary, limit))?,
            None => self.stream_lines(query, sink).await,
        }
    }

    async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let status = match resolve_binary(&self.config.binary) {
            Some(_) => match &self.config.working_dir {
                Some(dir) if !dir.is_dir() => HealthStatus::unhealthy(format!(
                    "working directory {} does not exist",
                    dir.display()
                )),
                _ => HealthStatus::healthy(),
            },
            None => HealthStatus::unhealthy(format!(
                "'{}' not found or not executable",
                self.config.binary
            )),
        };
        status.with_latency(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let mut map = AgentConfig::new();
        map.insert("binary".to_string(), json!("echo"));
        let backend = CommandBackend::from_config(&map).unwrap();
        assert_eq!(backend.config().pass_query_via, QueryInput::Arg);
        assert!(backend.config().args.is_empty());
        assert!(backend.config().timeout_secs.is_none());
    }

    #[test]
    fn test_config_requires_binary() {
        let err = CommandBackend::from_config(&AgentConfig::new()).err().unwrap();
        assert!(format!("{:#}", err).contains("binary"));
    }

    #[test]
    fn test_pass_query_via_parses_stdin() {
        let mut map = AgentConfig::new();
        map.insert("binary".to_string(), json!("cat"));
        map.insert("pass_query_via".to_string(), json!("stdin"));
        let backend = CommandBackend::from_config(&map).unwrap();
        assert_eq!(backend.config().pass_query_via, QueryInput::Stdin);
    }

    #[test]
    fn test_resolve_missing_binary() {
        assert!(resolve_binary("/definitely/not/here/agentry-bin").is_none());
        assert!(resolve_binary("agentry-no-such-binary-on-path").is_none());
    }
}
