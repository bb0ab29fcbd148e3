//! Phase ordering across CLI invocations.
//!
//! Each phase lists what the other phases' recorded statuses must be before
//! it may start. A violated requirement names the phase the operator should
//! run instead.

use crate::error::{Error, NextActionErr, Result};
use crate::grpc::idl::{Status, Step};
use crate::step::store::StepStore;

pub const RUN_INITIALIZE: &str = "To begin the upgrade, run \"gpupgrade initialize\".";
pub const RUN_EXECUTE: &str = "To proceed with the upgrade, run \"gpupgrade execute\".";
pub const RUN_FINALIZE: &str = "To complete the upgrade, run \"gpupgrade finalize\".";
pub const RUN_REVERT: &str =
    "To finish returning the cluster to its original state, run \"gpupgrade revert\".";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// No status recorded.
    NotStarted,
    /// Running, failed or complete.
    Started,
    Complete,
}

impl Condition {
    pub fn holds(&self, status: Status) -> bool {
        match self {
            Condition::NotStarted => status == Status::UnknownStatus,
            Condition::Started => matches!(status, Status::Running | Status::Failed | Status::Complete),
            Condition::Complete => status == Status::Complete,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Condition::NotStarted => "has already been started",
            Condition::Started => "has not been started",
            Condition::Complete => "has not completed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Requirement {
    pub step: Step,
    pub condition: Condition,
    pub next_action: &'static str,
}

const fn require(step: Step, condition: Condition, next_action: &'static str) -> Requirement {
    Requirement {
        step,
        condition,
        next_action,
    }
}

const INITIALIZE: &[Requirement] = &[
    require(Step::Revert, Condition::NotStarted, RUN_REVERT),
    require(Step::Finalize, Condition::NotStarted, RUN_FINALIZE),
    require(Step::Execute, Condition::NotStarted, RUN_EXECUTE),
];

const EXECUTE: &[Requirement] = &[
    require(Step::Revert, Condition::NotStarted, RUN_REVERT),
    require(Step::Initialize, Condition::Complete, RUN_INITIALIZE),
    require(Step::Finalize, Condition::NotStarted, RUN_FINALIZE),
];

const FINALIZE: &[Requirement] = &[
    require(Step::Revert, Condition::NotStarted, RUN_REVERT),
    require(Step::Initialize, Condition::Complete, RUN_INITIALIZE),
    require(Step::Execute, Condition::Complete, RUN_EXECUTE),
];

const REVERT: &[Requirement] = &[
    require(Step::Initialize, Condition::Started, RUN_INITIALIZE),
    require(Step::Finalize, Condition::NotStarted, RUN_FINALIZE),
];

pub fn requirements(step: Step) -> &'static [Requirement] {
    match step {
        Step::Initialize => INITIALIZE,
        Step::Execute => EXECUTE,
        Step::Finalize => FINALIZE,
        Step::Revert => REVERT,
        Step::UnknownStep => &[],
    }
}

pub fn command_name(step: Step) -> String {
    step.as_str_name().to_ascii_lowercase()
}

/// Checks `current` against the recorded status of every other phase. The
/// first violated requirement, in table order, is reported.
pub fn validate_step(store: &StepStore, current: Step) -> Result<()> {
    for req in requirements(current) {
        let status = store.read(req.step)?;
        if req.condition.holds(status) {
            continue;
        }

        let err = Error::Validation(format!(
            "Could not run gpupgrade {}: gpupgrade {} {}.",
            command_name(current),
            command_name(req.step),
            req.condition.describe()
        ));
        return Err(NextActionErr::new(err, req.next_action).into());
    }

    Ok(())
}
