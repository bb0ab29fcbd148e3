//! What the CLI says before and after each phase.

use std::collections::HashMap;
use std::path::Path;

use crate::config::Mode;
use crate::grpc::idl::Step as Phase;
use crate::step::substeps::help_list;

pub const GLOBAL_HELP: &str = "gpupgrade performs an in-place major-version upgrade of a Greenplum cluster.

Run the commands in this order:
  gpupgrade initialize    prepares the source cluster and creates the target cluster
  gpupgrade execute       upgrades the master and primary segments
  gpupgrade finalize      upgrades the standby and mirrors and swaps in the target cluster

gpupgrade revert returns the cluster to its original state any time before finalize.";

/// The substeps a phase runs, for the command's long help.
pub fn substep_help(phase: Phase) -> String {
    format!("Substeps:\n{}", help_list(phase))
}

pub struct InitializeSummary<'a> {
    pub log_dir: &'a Path,
    pub source: &'a str,
    pub source_port: i32,
    pub source_gphome: &'a Path,
    pub target_gphome: &'a Path,
    pub mode: Mode,
    pub disk_free_ratio: f64,
    pub use_hba_hostnames: bool,
    pub dynamic_library_path: &'a str,
    pub temp_port_range: &'a str,
    pub hub_port: u16,
    pub agent_port: u16,
}

pub fn initialize_confirmation(s: &InitializeSummary<'_>) -> String {
    format!(
        "
You are about to initialize a major-version upgrade of Greenplum.
This should be done only during a downtime window.

gpupgrade initialize will perform a series of steps, including:
 - Check disk space
 - Create the target cluster
 - Run pg_upgrade consistency checks

gpupgrade log files can be found on all hosts in {}

gpupgrade initialize will use these values from {}
source_master_port:   {}
source_gphome:        {}
target_gphome:        {}
mode:                 {}
disk_free_ratio:      {:.1}
use_hba_hostnames:    {}
dynamic_library_path: {}
temp_port_range:      {}
hub_port:             {}
agent_port:           {}

You will still have the opportunity to revert the cluster to its original state
after this step.

WARNING: Do not perform operations on the cluster until gpupgrade is
finalized or reverted.

Before proceeding, ensure the following have occurred:
 - Take a backup of the source Greenplum cluster
 - Generate and execute the data migration \"pre-initialize\" scripts
 - Run gpcheckcat to ensure the source catalog has no inconsistencies
 - Run gpstate -e to ensure the source cluster's segments are up and in preferred roles

To suppress this summary, use the --automatic | -a  flag.",
        s.log_dir.display(),
        s.source,
        s.source_port,
        s.source_gphome.display(),
        s.target_gphome.display(),
        s.mode.as_str(),
        s.disk_free_ratio,
        s.use_hba_hostnames,
        s.dynamic_library_path,
        s.temp_port_range,
        s.hub_port,
        s.agent_port,
    )
}

pub fn execute_confirmation(log_dir: &Path) -> String {
    format!(
        "
You are about to run the \"execute\" command for a major-version upgrade of Greenplum.
This should be done only during a downtime window.

gpupgrade execute will perform a series of steps, including:
 - Upgrade master
 - Upgrade primary segments

gpupgrade log files can be found on all hosts in {}

You will still have the opportunity to revert the cluster to its original state
after this step.

WARNING: Do not perform operations on the source cluster until gpupgrade is
finalized or reverted.",
        log_dir.display()
    )
}

pub fn finalize_confirmation(log_dir: &Path) -> String {
    format!(
        "
You are about to finalize a major-version upgrade of Greenplum.
This should be done only during a downtime window.

gpupgrade finalize will perform a series of steps, including:
 - Update target master catalog
 - Update data directories
 - Update target master configuration files
 - Upgrade standby master
 - Upgrade mirror segments

gpupgrade log files can be found on all hosts in {}

WARNING: You will not be able to revert the cluster to its original state after this step.

WARNING: Do not perform operations on the source and target clusters until gpupgrade is
finalized or reverted.",
        log_dir.display()
    )
}

pub fn revert_confirmation(log_dir: &Path) -> String {
    format!(
        "
You are about to revert this upgrade.
This should be done only during a downtime window.

gpupgrade revert will perform a series of steps, including:
 - Delete target cluster data directories
 - Delete state directories on the segments
 - Delete master state directory
 - Archive log directories
 - Restore source cluster
 - Start source cluster

gpupgrade log files can be found on all hosts in {}

WARNING: You cannot revert if you do not have mirrors & standby configured, and execute has started.

WARNING: Do not perform operations on the source and target clusters until gpupgrade revert
has completed.",
        log_dir.display()
    )
}

fn flag(data: &HashMap<String, String>, key: &str) -> bool {
    data.get(key).map(|v| v == "true").unwrap_or(false)
}

/// Warns when the source cluster lacks the standby or mirrors that revert
/// needs after execute has started.
pub fn initialize_warning(data: &HashMap<String, String>) -> String {
    let missing = match (flag(data, "has_standby"), flag(data, "has_mirrors")) {
        (false, false) => "standby and mirror segments",
        (true, false) => "mirror segments",
        (false, true) => "standby",
        (true, true) => return String::new(),
    };

    format!(
        "
WARNING
_______
The source cluster does not have {}.
After \"gpupgrade execute\" has been run, there will be no way to
return the cluster to its original state using \"gpupgrade revert\".

If you do not already have a backup, we strongly recommend that
you run \"gpupgrade revert\" now and take a backup of the cluster.
",
        missing
    )
}

pub fn initialize_complete(warning: &str) -> String {
    format!(
        "
Initialize completed successfully.
{}
NEXT ACTIONS
------------
To proceed with the upgrade, run \"gpupgrade execute\"
followed by \"gpupgrade finalize\".

To return the cluster to its original state, run \"gpupgrade revert\".",
        warning
    )
}

pub fn execute_complete(port: &str, datadir: &str) -> String {
    format!(
        "
Execute completed successfully.

The target cluster is now running. You may now run queries against the target
database and perform any other validation desired prior to finalizing your upgrade.
PGPORT: {}
MASTER_DATA_DIRECTORY: {}

WARNING: If any queries modify the target database prior to gpupgrade finalize,
it will be inconsistent with the source database.

NEXT ACTIONS
------------
If you are satisfied with the state of the cluster, run \"gpupgrade finalize\"
to proceed with the upgrade.

To return the cluster to its original state, run \"gpupgrade revert\".",
        port, datadir
    )
}

fn get<'a>(data: &'a HashMap<String, String>, key: &str) -> &'a str {
    data.get(key).map(String::as_str).unwrap_or_default()
}

pub fn finalize_complete(data: &HashMap<String, String>) -> String {
    format!(
        "
Finalize completed successfully.

The target cluster is now ready to use, running Greenplum {}.
PGPORT: {}
MASTER_DATA_DIRECTORY: {}

The source master data directory was archived to
{}

The gpupgrade logs can be found on the master and segment hosts in
{}

NEXT ACTIONS
------------
Run the \"complete\" data migration scripts, and recreate any additional tables,
indexes, and roles that were dropped or altered to resolve migration issues.",
        get(data, "target_version"),
        get(data, "target_port"),
        get(data, "target_master_data_directory"),
        get(data, "archived_source_master_data_directory"),
        get(data, "log_archive_directory"),
    )
}

pub fn revert_complete(data: &HashMap<String, String>) -> String {
    format!(
        "
Revert completed successfully.

The source cluster is now running version {}.
PGPORT: {}
MASTER_DATA_DIRECTORY: {}

The gpupgrade logs can be found on the master and segment hosts in
{}

NEXT ACTIONS
------------
To use the reverted cluster, run the \"revert\" data migration scripts, and
recreate any additional tables, indexes, and roles that were dropped or
altered to resolve migration issues.

To restart the upgrade, run \"gpupgrade initialize\" again.",
        get(data, "source_version"),
        get(data, "source_port"),
        get(data, "source_master_data_directory"),
        get(data, "revert_log_archive_directory"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_initialize_warning() {
        assert!(initialize_warning(&data(&[("has_standby", "true"), ("has_mirrors", "true")])).is_empty());
        assert!(initialize_warning(&data(&[("has_standby", "true"), ("has_mirrors", "false")]))
            .contains("does not have mirror segments."));
        assert!(initialize_warning(&data(&[("has_standby", "false"), ("has_mirrors", "true")]))
            .contains("does not have standby."));
        assert!(initialize_warning(&HashMap::new()).contains("does not have standby and mirror segments."));
    }

    #[test]
    fn test_revert_complete() {
        let text = revert_complete(&data(&[
            ("source_version", "6.20.0"),
            ("source_port", "15432"),
            ("source_master_data_directory", "/data/qddir/demoDataDir-1"),
            ("revert_log_archive_directory", "/home/gpadmin/gpAdminLogs/gpupgrade-x"),
        ]));
        assert!(text.contains("running version 6.20.0.\nPGPORT: 15432\nMASTER_DATA_DIRECTORY: /data/qddir/demoDataDir-1\n"));
        assert!(text.contains("\n/home/gpadmin/gpAdminLogs/gpupgrade-x\n"));
    }

    #[test]
    fn test_substep_help_lists_phase() {
        let help = substep_help(Phase::Execute);
        assert!(help.starts_with("Substeps:\n - "));
        assert!(help.contains("Upgrade master"));
    }
}
