//! Subprocess invocation behind a replaceable capability.
//!
//! Production code runs children through [`ShellRunner`]; tests swap in a
//! [`MockRunner`] that answers with canned exit codes and output.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::step::stream::OutStreams;

/// Maximum number of stderr bytes quoted in a subprocess error.
const STDERR_PREFIX_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    /// Variables set for the child on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Start from an empty environment instead of inheriting this process's.
    pub clear_env: bool,
    pub current_dir: Option<PathBuf>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            clear_env: false,
            current_dir: None,
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

    /// Clears the inherited environment and sets only `vars`.
    pub fn env_clear_with<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.clear_env = true;
        self.env = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Output {
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[tonic::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `cmd` to completion and returns whatever it exited with.
    ///
    /// Output is always captured. When `streams` is given, bytes are also
    /// forwarded to it as they arrive.
    async fn output(&self, cmd: &Command, streams: Option<&dyn OutStreams>) -> Result<Output>;

    /// Like [`CommandRunner::output`] but a non-zero exit becomes
    /// [`Error::Subprocess`].
    async fn run(&self, cmd: &Command, streams: Option<&dyn OutStreams>) -> Result<Output> {
        let output = self.output(cmd, streams).await?;
        check_exit(cmd, output)
    }
}

pub type SharedRunner = Arc<dyn CommandRunner>;

pub fn check_exit(cmd: &Command, output: Output) -> Result<Output> {
    if output.code == 0 {
        return Ok(output);
    }

    let end = output.stderr.len().min(STDERR_PREFIX_LEN);
    let stderr = String::from_utf8_lossy(&output.stderr[..end])
        .trim_end()
        .to_string();

    Err(Error::subprocess(cmd.program.clone(), output.code, stderr))
}

/// Runs children with the OS process primitives.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

#[derive(Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

async fn drain<R>(mut reader: R, pipe: Pipe, streams: Option<&dyn OutStreams>) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| Error::io("reading child output", e))?;
        if n == 0 {
            break;
        }

        captured.extend_from_slice(&buf[..n]);
        if let Some(streams) = streams {
            let written = match pipe {
                Pipe::Stdout => streams.stdout(&buf[..n]),
                Pipe::Stderr => streams.stderr(&buf[..n]),
            };
            written.map_err(|e| Error::io("forwarding child output", e))?;
        }
    }

    Ok(captured)
}

#[tonic::async_trait]
impl CommandRunner for ShellRunner {
    async fn output(&self, cmd: &Command, streams: Option<&dyn OutStreams>) -> Result<Output> {
        let mut command = tokio::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if cmd.clear_env {
            command.env_clear();
        }
        command.envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        if let Some(dir) = &cmd.current_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::io(format!("starting {}", cmd.program), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Validation(format!("{}: stdout not captured", cmd.program)))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Validation(format!("{}: stderr not captured", cmd.program)))?;

        let (stdout, stderr, status) = tokio::try_join!(
            drain(stdout, Pipe::Stdout, streams),
            drain(stderr, Pipe::Stderr, streams),
            async {
                child
                    .wait()
                    .await
                    .map_err(|e| Error::io(format!("waiting for {}", cmd.program), e))
            },
        )?;

        // Killed by a signal reports no code.
        let code = status.code().unwrap_or(-1);

        Ok(Output {
            code,
            stdout,
            stderr,
        })
    }
}

type Handler = dyn Fn(&Command) -> Output + Send + Sync;

/// In-process fake that records every command and answers via a handler.
pub struct MockRunner {
    calls: Mutex<Vec<Command>>,
    handler: Box<Handler>,
}

impl MockRunner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Command) -> Output + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        }
    }

    /// Every command exits 0 with no output.
    pub fn succeeding() -> Self {
        Self::new(|_| Output::default())
    }

    pub fn calls(&self) -> Vec<Command> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Commands whose rendered form contains `needle`.
    pub fn calls_matching(&self, needle: &str) -> Vec<Command> {
        self.calls()
            .into_iter()
            .filter(|c| c.to_string().contains(needle))
            .collect()
    }
}

#[tonic::async_trait]
impl CommandRunner for MockRunner {
    async fn output(&self, cmd: &Command, streams: Option<&dyn OutStreams>) -> Result<Output> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(cmd.clone());

        let output = (self.handler)(cmd);

        if let Some(streams) = streams {
            streams
                .stdout(&output.stdout)
                .and_then(|_| streams.stderr(&output.stderr))
                .map_err(|e| Error::io("forwarding mock output", e))?;
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::stream::BufferedStreams;

    #[tokio::test]
    async fn test_shell_runner_captures_output() {
        let cmd = Command::new("sh").args(["-c", "echo out; echo err >&2"]);
        let output = ShellRunner.run(&cmd, None).await.unwrap();

        assert_eq!(output.code, 0);
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
    }

    #[tokio::test]
    async fn test_shell_runner_forwards_to_streams() {
        let streams = BufferedStreams::new();
        let cmd = Command::new("sh").args(["-c", "printf hello; printf oops >&2"]);
        ShellRunner.run(&cmd, Some(&streams)).await.unwrap();

        assert_eq!(streams.take_stdout(), b"hello");
        assert_eq!(streams.take_stderr(), b"oops");
    }

    #[tokio::test]
    async fn test_nonzero_exit_includes_stderr_and_code() {
        let cmd = Command::new("sh").args(["-c", "echo broken >&2; exit 3"]);
        let err = ShellRunner.run(&cmd, None).await.unwrap_err();

        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(err.to_string(), "sh failed with exit code 3: broken");
    }

    #[tokio::test]
    async fn test_env_is_cleared() {
        let cmd = Command::new("/usr/bin/env").env_clear_with([("ONLY", "1")]);
        let output = ShellRunner.run(&cmd, None).await.unwrap();
        assert_eq!(output.stdout_text(), "ONLY=1\n");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let cmd = Command::new("/definitely/not/a/program");
        let err = ShellRunner.run(&cmd, None).await.unwrap_err();
        assert!(err.io_error().is_some());
    }

    #[tokio::test]
    async fn test_mock_runner_records_calls() {
        let runner = MockRunner::new(|cmd| {
            if cmd.program == "fail" {
                Output::failure(1, "nope")
            } else {
                Output::success("ok")
            }
        });

        let streams = BufferedStreams::new();
        runner.run(&Command::new("echo").arg("hi"), Some(&streams)).await.unwrap();
        assert!(runner.run(&Command::new("fail"), None).await.is_err());

        assert_eq!(runner.calls().len(), 2);
        assert_eq!(runner.calls_matching("echo hi").len(), 1);
        assert_eq!(streams.take_stdout(), b"ok");
    }
}
