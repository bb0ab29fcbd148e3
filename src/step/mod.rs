//! Resumable execution of a phase on the hub.
//!
//! A [`Step`] walks the substeps of one phase. Each substep's outcome is
//! persisted before the next one starts, so a phase re-run after a failure
//! skips whatever already completed.

pub mod store;
pub mod stream;
pub mod substeps;
pub mod validate;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::{debug, info, warn, Logger};
use tokio_util::sync::CancellationToken;

use crate::env::Env;
use crate::error::{Error, ErrorList, Result};
use crate::grpc::idl::{message::Contents, Message, Response, Status, Step as Phase, Substep, SubstepStatus};
use store::FileStore;
use stream::{MessageSender, MultiplexedStream, OutStreams};

/// Renders like `1.503s` or `250ms`.
pub fn format_duration(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else if d < Duration::from_secs(60) {
        format!("{:.3}s", d.as_secs_f64())
    } else {
        let secs = d.as_secs();
        format!("{}m{}s", secs / 60, secs % 60)
    }
}

/// Capitalized phase name: `Initialize`.
pub fn title(phase: Phase) -> String {
    let lower = phase.as_str_name().to_ascii_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

pub struct Step {
    name: Phase,
    sender: Arc<dyn MessageSender>,
    store: FileStore,
    streams: Arc<MultiplexedStream>,
    cancel: CancellationToken,
    logger: Logger,
    err: Option<Error>,
}

impl Step {
    pub fn new(
        name: Phase,
        sender: Arc<dyn MessageSender>,
        store: FileStore,
        streams: Arc<MultiplexedStream>,
        cancel: CancellationToken,
        logger: Logger,
    ) -> Self {
        Self {
            name,
            sender,
            store,
            streams,
            cancel,
            logger,
            err: None,
        }
    }

    /// Opens `<log_dir>/<phase>_<YYYYMMDD>.log` and the status store for a
    /// phase the CLI just asked the hub to drive.
    pub fn begin(
        name: Phase,
        env: &Env,
        sender: Arc<dyn MessageSender>,
        cancel: CancellationToken,
        logger: Logger,
    ) -> Result<Self> {
        let phase = name.as_str_name().to_ascii_lowercase();
        let path = env.log_dir.join(format!(
            "{}_{}.log",
            phase,
            chrono::Local::now().format("%Y%m%d")
        ));

        std::fs::create_dir_all(&env.log_dir)
            .map_err(|e| Error::io(format!("creating log directory {:?}", env.log_dir), e))?;

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(format!("step {:?}: opening {:?}", phase, path), e))?;

        write!(log, "\n{} in progress.\n", title(name))
            .map_err(|e| Error::io(format!("logging step {:?}", phase), e))?;

        let store = FileStore::open(env.steps_path())?;
        let logger = logger.new(slog::o!("step" => phase));
        let streams = Arc::new(MultiplexedStream::new(sender.clone(), Some(log), logger.clone()));

        Ok(Self::new(name, sender, store, streams, cancel, logger))
    }

    pub fn name(&self) -> Phase {
        self.name
    }

    pub fn streams(&self) -> Arc<dyn OutStreams> {
        self.streams.clone()
    }

    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Fires when the CLI driving this phase goes away.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sends the phase's final key/value results to the CLI.
    pub fn send_response(&self, data: HashMap<String, String>) -> Result<()> {
        let message = Message {
            contents: Some(Contents::Response(Response { data })),
        };
        self.sender.send(message)
    }

    fn send_status(&self, substep: Substep, status: Status) {
        let message = Message {
            contents: Some(Contents::Status(SubstepStatus {
                substep: substep as i32,
                status: status as i32,
            })),
        };

        // A vanished client must not fail the substep; the store is the
        // record of what happened.
        if let Err(e) = self.sender.send(message) {
            debug!(self.logger, "dropping status update"; "substep" => substep.as_str_name(), "error" => %e);
        }
    }

    /// Persists `status`, then reports it. An explicitly skipped substep is
    /// stored as complete so a re-run does not attempt it again.
    fn write(&self, substep: Substep, status: Status) -> Result<()> {
        let stored = match status {
            Status::Skipped => Status::Complete,
            other => other,
        };

        self.store.write(self.name, substep, stored)?;
        self.send_status(substep, status);
        Ok(())
    }

    pub async fn run<F, Fut>(&mut self, substep: Substep, f: F)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.run_substep(substep, f, false).await
    }

    /// Runs `f` even when a previous invocation completed it.
    pub async fn always_run<F, Fut>(&mut self, substep: Substep, f: F)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.run_substep(substep, f, true).await
    }

    /// Runs `f` only when `should_run` holds. Nothing is recorded otherwise.
    pub async fn run_conditionally<F, Fut>(&mut self, substep: Substep, should_run: bool, f: F)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if !should_run {
            info!(self.logger, "skipping substep"; "substep" => substep.as_str_name());
            return;
        }
        self.run_substep(substep, f, false).await
    }

    /// Runs bookkeeping that has no substep of its own.
    pub async fn run_internal_substep<F, Fut>(&mut self, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.err.is_some() {
            return;
        }

        if let Err(err) = f().await {
            self.err = Some(err);
        }
    }

    async fn run_substep<F, Fut>(&mut self, substep: Substep, f: F, always_run: bool)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.err.is_some() {
            return;
        }

        if self.cancel.is_cancelled() {
            self.err = Some(Error::Canceled);
            return;
        }

        if let Err(err) = self.try_run(substep, f, always_run).await {
            self.err = Some(err.context(format!("substep {:?}", substep.as_str_name())));
        }
    }

    async fn try_run<F, Fut>(&self, substep: Substep, f: F, always_run: bool) -> Result<()>
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let status = self.store.read(self.name, substep)?;

        if status == Status::Running {
            self.send_status(substep, Status::Failed);
            return Err(Error::Validation(format!(
                "Found previous substep {} was running. Manual intervention needed to cleanup. Please contact support.",
                substep.as_str_name()
            )));
        }

        if status == Status::Complete && !always_run {
            // Report only; the store already says complete.
            self.send_status(substep, Status::Skipped);
            return Ok(());
        }

        let started = Instant::now();
        let mut errs = ErrorList::new();
        errs.push_result(self.execute(substep, f).await);

        let elapsed = format!(
            "\n{} took {}\n\n",
            substep.as_str_name(),
            format_duration(started.elapsed())
        );
        errs.push_result(
            self.streams
                .print(&elapsed)
                .map_err(|e| Error::io("printing substep duration", e)),
        );

        errs.into_result()
    }

    async fn execute<F, Fut>(&self, substep: Substep, f: F) -> Result<()>
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.streams
            .print(&format!("\nStarting {}...\n\n", substep.as_str_name()))
            .map_err(|e| Error::io("printing substep banner", e))?;

        self.write(substep, Status::Running)?;
        info!(self.logger, "starting substep"; "substep" => substep.as_str_name());

        match f(self.streams.clone()).await {
            Ok(()) => self.write(substep, Status::Complete),
            Err(err) if err.is_skip() => self.write(substep, Status::Skipped),
            Err(err) => {
                warn!(self.logger, "substep failed"; "substep" => substep.as_str_name(), "error" => %err);
                let mut errs = ErrorList::new();
                errs.push(err);
                errs.push_result(self.write(substep, Status::Failed));
                errs.into_result()
            }
        }
    }

    /// Closes the log and returns the first substep error, if any. A
    /// canceled phase is recorded as failed since no CLI is left to do it.
    pub fn finish(self) -> Result<()> {
        if let Err(e) = self.streams.close() {
            let mut errs: ErrorList = self.err.into_iter().collect();
            errs.push(Error::io(format!("step {:?}", self.name.as_str_name()), e));
            return errs.into_result();
        }

        match self.err {
            Some(err) if self.cancel.is_cancelled() => {
                if let Err(e) = self.store.write(self.name, Substep::StepStatus, Status::Failed) {
                    warn!(self.logger, "recording canceled step"; "error" => %e);
                }
                Err(err)
            }
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
