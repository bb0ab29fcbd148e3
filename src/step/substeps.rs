//! What each substep is called on screen, and the order each phase runs
//! them in.

use crate::grpc::idl::{Status, Step, Substep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubstepText {
    /// Shown while the substep runs, e.g. "Stopping source cluster...".
    pub output: &'static str,
    /// Used in command help, e.g. "Stop source cluster".
    pub help: &'static str,
}

const fn text(output: &'static str, help: &'static str) -> SubstepText {
    SubstepText { output, help }
}

pub fn description(substep: Substep) -> SubstepText {
    use Substep::*;

    match substep {
        UnknownSubstep => text("Unknown substep...", "Unknown substep"),
        StepStatus => text("Recording step status...", "Record step status"),
        CreatingDirectories => text("Creating directories...", "Create directories"),
        SavingSourceClusterConfig => text(
            "Saving source cluster configuration...",
            "Save source cluster configuration",
        ),
        StartHub => text("Starting gpupgrade hub process...", "Start gpupgrade hub process"),
        StartAgents => text(
            "Starting gpupgrade agent processes...",
            "Start gpupgrade agent processes",
        ),
        CheckDiskSpace => text("Checking disk space...", "Check disk space"),
        GenerateTargetConfig => text(
            "Generating target cluster configuration...",
            "Generate target cluster configuration",
        ),
        InitTargetCluster => text("Creating target cluster...", "Create target cluster"),
        ShutdownTargetCluster => text("Stopping target cluster...", "Stop target cluster"),
        BackupTargetMaster => text("Backing up target master...", "Back up target master"),
        CheckUpgrade => text("Running pg_upgrade checks...", "Run pg_upgrade checks"),
        ShutdownSourceCluster => text("Stopping source cluster...", "Stop source cluster"),
        UpgradeMaster => text("Upgrading master...", "Upgrade master"),
        CopyMaster => text(
            "Copying master catalog to primary segments...",
            "Copy master catalog to primary segments",
        ),
        UpgradePrimaries => text("Upgrading primary segments...", "Upgrade primary segments"),
        StartTargetCluster => text("Starting target cluster...", "Start target cluster"),
        UpdateTargetCatalog => text(
            "Updating target master catalog...",
            "Update target master catalog",
        ),
        UpdateDataDirectories => text("Updating data directories...", "Update data directories"),
        UpdateTargetConfFiles => text(
            "Updating target master configuration files...",
            "Update target master configuration files",
        ),
        UpgradeStandby => text("Upgrading standby master...", "Upgrade standby master"),
        UpgradeMirrors => text("Upgrading mirror segments...", "Upgrade mirror segments"),
        DeletePrimaryDatadirs => text(
            "Deleting primary segment data directories...",
            "Delete primary segment data directories",
        ),
        DeleteMasterDatadir => text(
            "Deleting master data directory...",
            "Delete master data directory",
        ),
        DeleteSegmentStatedirs => text(
            "Deleting state directories on the segments...",
            "Delete state directories on the segments",
        ),
        StopHubAndAgents => text("Stopping hub and agents...", "Stop hub and agents"),
        DeleteMasterStatedir => text(
            "Deleting master state directory...",
            "Delete master state directory",
        ),
        ArchiveLogDirectories => text("Archiving log directories...", "Archive log directories"),
        RestoreSourceCluster => text("Restoring source cluster...", "Restore source cluster"),
        StartSourceCluster => text("Starting source cluster...", "Start source cluster"),
        RestorePgcontrol => text("Re-enabling source cluster...", "Re-enable source cluster"),
        RecoversegSourceCluster => text(
            "Recovering source cluster mirrors...",
            "Recover source cluster mirrors",
        ),
    }
}

const INITIALIZE: &[Substep] = &[
    Substep::CreatingDirectories,
    Substep::SavingSourceClusterConfig,
    Substep::StartHub,
    Substep::StartAgents,
    Substep::CheckDiskSpace,
    Substep::GenerateTargetConfig,
    Substep::InitTargetCluster,
    Substep::ShutdownTargetCluster,
    Substep::BackupTargetMaster,
    Substep::CheckUpgrade,
];

const EXECUTE: &[Substep] = &[
    Substep::ShutdownSourceCluster,
    Substep::UpgradeMaster,
    Substep::CopyMaster,
    Substep::UpgradePrimaries,
    Substep::StartTargetCluster,
];

const FINALIZE: &[Substep] = &[
    Substep::UpgradeStandby,
    Substep::UpgradeMirrors,
    Substep::ShutdownTargetCluster,
    Substep::UpdateTargetCatalog,
    Substep::UpdateDataDirectories,
    Substep::UpdateTargetConfFiles,
    Substep::StartTargetCluster,
    Substep::ArchiveLogDirectories,
    Substep::DeleteSegmentStatedirs,
    Substep::StopHubAndAgents,
    Substep::DeleteMasterStatedir,
];

const REVERT: &[Substep] = &[
    Substep::ShutdownTargetCluster,
    Substep::RestorePgcontrol,
    Substep::RestoreSourceCluster,
    Substep::DeletePrimaryDatadirs,
    Substep::DeleteMasterDatadir,
    Substep::ArchiveLogDirectories,
    Substep::DeleteSegmentStatedirs,
    Substep::StartSourceCluster,
    Substep::RecoversegSourceCluster,
    Substep::StopHubAndAgents,
    Substep::DeleteMasterStatedir,
];

/// Every substep a phase may run, in the order it runs them. Conditional
/// substeps are included.
pub fn phase_substeps(step: Step) -> &'static [Substep] {
    match step {
        Step::Initialize => INITIALIZE,
        Step::Execute => EXECUTE,
        Step::Finalize => FINALIZE,
        Step::Revert => REVERT,
        Step::UnknownStep => &[],
    }
}

/// Bulleted help text listing the substeps of `step`.
pub fn help_list(step: Step) -> String {
    phase_substeps(step)
        .iter()
        .map(|s| format!(" - {}", description(*s).help))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn indicator(status: Status) -> &'static str {
    match status {
        Status::Running => "[IN PROGRESS]",
        Status::Complete => "[COMPLETE]",
        Status::Failed => "[FAILED]",
        Status::Skipped => "[SKIPPED]",
        Status::UnknownStatus => "[UNKNOWN]",
    }
}

/// One status line: the description padded to 67 columns, then the
/// indicator padded to 13.
pub fn format(description: &str, status: Status) -> String {
    format!("{:<67}{:<13}", description, indicator(status))
}

pub fn format_status(substep: Substep, status: Status) -> String {
    format(description(substep).output, status)
}
