//! The CLI side of a phase.
//!
//! A [`Step`] owns the phase's entry in the status store. It checks the
//! phase may run, asks the operator to confirm, then runs a short list of
//! substeps. Most of the work happens in a single hub substep that streams
//! the hub's progress to the terminal.

use std::future::Future;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error};

use crate::env::Env;
use crate::error::{Error, ErrorList, NextActionErr, Result};
use crate::grpc::idl::{Status, Step as Phase, Substep};
use crate::step::store::{FileStore, StepStore};
use crate::step::stream::{BufferedStreams, OutStreams};
use crate::step::substeps::format_status;
use crate::step::validate::{command_name, validate_step, RUN_INITIALIZE};
use crate::step::{format_duration, title};

const RUN_REVERT_TEXT: &str =
    "\nIf you would like to return the cluster to its original state, please run \"gpupgrade revert\".";

/// The confirmation shown before a phase starts, and where the answer is
/// read from.
pub struct Prompt<'a> {
    pub text: String,
    pub input: &'a mut dyn BufRead,
}

pub struct Step {
    phase: Phase,
    store: Option<StepStore>,
    streams: Arc<BufferedStreams>,
    console: Arc<dyn OutStreams>,
    verbose: bool,
    started: Instant,
    last_substep: Option<Substep>,
    err: Option<Error>,
}

impl Step {
    /// Validates `phase` against the recorded status of the others, asks
    /// for confirmation when `prompt` is given, and marks the phase running.
    ///
    /// Declining the prompt returns [`Error::UserCanceled`].
    pub fn new(
        phase: Phase,
        env: &Env,
        console: Arc<dyn OutStreams>,
        verbose: bool,
        prompt: Option<Prompt<'_>>,
    ) -> Result<Self> {
        let store = FileStore::open(env.steps_path()).map(StepStore::new).map_err(|e| {
            error!("creating step store: {}", e);
            let err = Error::Validation(format!(
                "{}\n\nNote: If commands were issued in order, ensure gpupgrade can write to {}",
                e,
                env.state_dir.display()
            ));
            Error::from(NextActionErr::new(err, RUN_INITIALIZE))
        })?;

        validate_step(&store, phase)?;

        if let Some(prompt) = prompt {
            print(console.as_ref(), &format!("{}\n", prompt.text))?;
            if !confirm(prompt.input, console.as_ref(), &command_name(phase))? {
                return Err(Error::UserCanceled);
            }
        }

        store.write(phase, Status::Running)?;
        print(console.as_ref(), &format!("\n{} in progress.\n\n", title(phase)))?;

        Ok(Self {
            phase,
            store: Some(store),
            streams: Arc::new(BufferedStreams::new()),
            console,
            verbose,
            started: Instant::now(),
            last_substep: None,
            err: None,
        })
    }

    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Runs the RPC that drives the phase on the hub. The hub reports its
    /// own substeps, so nothing is printed here.
    pub async fn run_hub_substep<F, Fut>(&mut self, f: F)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.err.is_some() {
            return;
        }

        match f(self.console.clone()).await {
            Err(err) if !err.is_skip() => self.err = Some(err),
            _ => {}
        }
    }

    /// Runs CLI-local bookkeeping with no status line.
    pub async fn run_internal_substep<F, Fut>(&mut self, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.err.is_some() {
            return;
        }

        match f().await {
            Err(err) if !err.is_skip() => self.err = Some(err),
            _ => {}
        }
    }

    /// Runs `f` between an in-progress status line and its outcome. In
    /// verbose mode whatever `f` wrote is shown between the two.
    pub async fn run_cli_substep<F, Fut>(&mut self, substep: Substep, f: F)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.err.is_some() {
            return;
        }

        let started = Instant::now();
        let mut errs = ErrorList::new();

        errs.push_result(self.print_status(substep, Status::Running));

        let streams: Arc<dyn OutStreams> = self.streams.clone();
        let result = f(streams).await;
        let skipped = matches!(&result, Err(e) if e.is_skip());
        if !skipped {
            errs.push_result(result);
        }

        if self.verbose {
            errs.push_result(self.flush_streams());
        }

        let status = if !errs.is_empty() {
            Status::Failed
        } else if skipped {
            Status::Skipped
        } else {
            Status::Complete
        };
        errs.push_result(self.print_status(substep, status));
        errs.push_result(self.log_duration(substep.as_str_name(), started));

        if let Err(err) = errs.into_result() {
            self.err = Some(err.context(format!("substep {:?}", substep.as_str_name())));
        }
    }

    /// Stops recording phase status, as once the state directory holding
    /// the store is about to be removed.
    pub fn disable_store(&mut self) {
        self.store = None;
    }

    /// Records how the phase ended. On success prints `completed_text`; on
    /// failure returns the error decorated with what to do next.
    pub fn complete(mut self, completed_text: &str) -> Result<()> {
        let mut errs: ErrorList = self.err.take().into_iter().collect();
        errs.push_result(self.log_duration(&title(self.phase), self.started));

        let status = if errs.is_empty() { Status::Complete } else { Status::Failed };
        if let Some(store) = &self.store {
            errs.push_result(store.write(self.phase, status));
        }

        match errs.into_result() {
            Ok(()) => print(self.console.as_ref(), &format!("{}\n", completed_text)),
            Err(err) => {
                // Keep the error text apart from the last status line.
                let _ = print(self.console.as_ref(), "\n");

                if matches!(err.root(), Error::NextAction(_)) {
                    return Err(err);
                }

                let mut next_action = format!(
                    "Please address the above issue and run \"gpupgrade {}\" again.",
                    command_name(self.phase)
                );
                if matches!(self.phase, Phase::Initialize | Phase::Execute) {
                    next_action.push_str(RUN_REVERT_TEXT);
                }
                Err(NextActionErr::new(err, next_action).into())
            }
        }
    }

    fn print_status(&mut self, substep: Substep, status: Status) -> Result<()> {
        let mut line = String::new();
        if self.last_substep == Some(substep) {
            line.push('\r');
        }
        line.push_str(&format_status(substep, status));
        if status != Status::Running {
            line.push('\n');
        }

        self.last_substep = Some(substep);
        print(self.console.as_ref(), &line)
    }

    fn flush_streams(&self) -> Result<()> {
        // Move the cursor off the in-progress line first.
        print(self.console.as_ref(), "\n")?;
        self.console
            .stdout(&self.streams.take_stdout())
            .map_err(|e| Error::io("writing stdout", e))?;
        self.console
            .stderr(&self.streams.take_stderr())
            .map_err(|e| Error::io("writing stderr", e))
    }

    fn log_duration(&self, operation: &str, started: Instant) -> Result<()> {
        let msg = format!("{} took {}", operation, format_duration(started.elapsed()));
        debug!("{}", msg);
        if self.verbose {
            print(self.console.as_ref(), &format!("{}\n\n", msg))?;
        }
        Ok(())
    }
}

fn print(console: &dyn OutStreams, text: &str) -> Result<()> {
    console.print(text).map_err(|e| Error::io("writing to terminal", e))
}

/// Asks until the operator answers `y` or `n`. Running out of input counts
/// as `n`.
pub fn confirm(input: &mut dyn BufRead, console: &dyn OutStreams, command: &str) -> Result<bool> {
    loop {
        print(console, &format!("Continue with gpupgrade {}?  Yy|Nn: ", command))?;

        let mut answer = String::new();
        let read = input
            .read_line(&mut answer)
            .map_err(|e| Error::io("reading confirmation", e))?;

        if read == 0 {
            print(console, "\nCanceling upgrade\n")?;
            return Ok(false);
        }

        match answer.trim().to_ascii_lowercase().as_str() {
            "y" => {
                print(console, "\nProceeding with upgrade\n\n")?;
                return Ok(true);
            }
            "n" => {
                print(console, "\nCanceling upgrade\n")?;
                return Ok(false);
            }
            _ => {}
        }
    }
}
