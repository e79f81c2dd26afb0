//! External tool invocation
//!
//! Drivers never spawn processes directly: they describe an [`Invocation`]
//! and hand it to a [`CommandRunner`]. The process runner is used by the
//! CLI, the mock runner by tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;

use crate::error::{DriverError, Result};

/// One command line to run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Written to the process standard input
    pub stdin: Option<String>,
    pub current_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Program and arguments joined by spaces
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn failure(&self, status: impl Into<String>, stderr: impl Into<String>) -> DriverError {
        DriverError::Collaborator {
            tool: self.program.clone(),
            args: self.args.clone(),
            status: status.into(),
            stderr: stderr.into(),
        }
    }
}

/// Captured output of a successful run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion; a non-zero exit is a `Collaborator` error
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Run and report success, without failing on a non-zero exit
    async fn probe(&self, invocation: &Invocation) -> Result<bool> {
        match self.run(invocation).await {
            Ok(_) => Ok(true),
            Err(DriverError::Collaborator { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Runs commands as child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        tracing::debug!(command = %invocation.command_line(), "running");

        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(&invocation.env)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| invocation.failure("not started", e.to_string()))?;

        if let (Some(input), Some(mut stdin)) = (&invocation.stdin, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
        }

        // dropping the child on Ctrl-C kills it
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = tokio::signal::ctrl_c() => return Err(DriverError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if interrupted(&output.status) {
            return Err(DriverError::Cancelled);
        }
        if !output.status.success() {
            return Err(invocation.failure(output.status.to_string(), stderr));
        }

        tracing::trace!(command = %invocation.command_line(), stdout = %stdout, "finished");
        Ok(CommandOutput { stdout, stderr })
    }
}

/// Killed by SIGINT or SIGTERM, or exited the way shells report it
fn interrupted(status: &ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if matches!(status.signal(), Some(2) | Some(15)) {
            return true;
        }
    }
    status.code() == Some(130)
}

/// Scripted answer of the mock runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    Success(String),
    Failure(String),
    Cancelled,
}

/// In-memory runner for testing
///
/// Records every invocation. Responses are matched on a command line
/// prefix; the last queued response for a prefix is reused.
#[derive(Debug, Clone, Default)]
pub struct MockRunner {
    calls: Arc<Mutex<Vec<Invocation>>>,
    responses: Arc<Mutex<Vec<(String, VecDeque<MockResponse>)>>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for commands starting with `prefix`
    pub fn respond(&self, prefix: &str, response: MockResponse) -> &Self {
        let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        match responses.iter_mut().find(|(p, _)| p == prefix) {
            Some((_, queue)) => queue.push_back(response),
            None => responses.push((prefix.to_string(), VecDeque::from([response]))),
        }
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::command_line).collect()
    }

    fn next_response(&self, command_line: &str) -> MockResponse {
        let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        let matching = responses
            .iter_mut()
            .filter(|(prefix, _)| command_line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());

        match matching {
            Some((_, queue)) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or(MockResponse::Success(String::new())),
            Some((_, queue)) => queue
                .front()
                .cloned()
                .unwrap_or(MockResponse::Success(String::new())),
            None => MockResponse::Success(String::new()),
        }
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(invocation.clone());

        match self.next_response(&invocation.command_line()) {
            MockResponse::Success(stdout) => Ok(CommandOutput {
                stdout,
                stderr: String::new(),
            }),
            MockResponse::Failure(stderr) => Err(invocation.failure("exit status: 1", stderr)),
            MockResponse::Cancelled => Err(DriverError::Cancelled),
        }
    }
}
