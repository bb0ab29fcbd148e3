//! Reading cluster state out of a live coordinator with `psql`.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::cluster::control::greenplum_command;
use crate::cluster::{Cluster, Role, SegConfig};
use crate::error::{Error, Result};
use crate::exec::{Command, CommandRunner};

pub const SEGMENT_CONFIGURATION_QUERY: &str =
    "SELECT dbid, content, port, hostname, datadir, role FROM gp_segment_configuration ORDER BY content";

const FIELD_SEPARATOR: &str = "|";

/// A `psql` session against a cluster's coordinator.
#[derive(Debug, Clone)]
pub struct Psql<'a> {
    cluster: &'a Cluster,
    port: i32,
    database: String,
    utility_mode: bool,
    allow_system_table_mods: bool,
}

impl<'a> Psql<'a> {
    pub fn new(cluster: &'a Cluster) -> Result<Self> {
        Ok(Self {
            port: cluster.coordinator_port()?,
            cluster,
            database: "template1".to_string(),
            utility_mode: false,
            allow_system_table_mods: false,
        })
    }

    pub fn with_port(mut self, port: i32) -> Self {
        self.port = port;
        self
    }

    /// Connect without dispatching to segments, as needed while only the
    /// coordinator is up.
    pub fn with_utility_mode(mut self) -> Self {
        self.utility_mode = true;
        self
    }

    pub fn with_system_table_mods(mut self) -> Self {
        self.allow_system_table_mods = true;
        self
    }

    fn pgoptions(&self) -> Option<String> {
        let mut opts = Vec::new();
        if self.utility_mode {
            opts.push("-c gp_role=utility");
        }
        if self.allow_system_table_mods {
            opts.push("-c allow_system_table_mods=true");
        }
        if opts.is_empty() {
            None
        } else {
            Some(opts.join(" "))
        }
    }

    pub fn command(&self, sql: &str) -> Result<Command> {
        let args: Vec<String> = [
            "-X",
            "-A",
            "-t",
            "-v",
            "ON_ERROR_STOP=1",
            "-F",
            FIELD_SEPARATOR,
            "-p",
            &self.port.to_string(),
            "-d",
            &self.database,
            "-c",
            sql,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let mut cmd = greenplum_command(self.cluster, "psql", &args)?;
        if let Some(opts) = self.pgoptions() {
            cmd = cmd.env("PGOPTIONS", opts);
        }
        Ok(cmd)
    }

    /// Runs a statement, discarding output.
    pub async fn execute(&self, runner: &dyn CommandRunner, sql: &str) -> Result<()> {
        runner.run(&self.command(sql)?, None).await?;
        Ok(())
    }

    /// Runs a query and returns its rows split into fields.
    pub async fn query(&self, runner: &dyn CommandRunner, sql: &str) -> Result<Vec<Vec<String>>> {
        let output = runner.run(&self.command(sql)?, None).await?;
        Ok(parse_rows(&output.stdout_text()))
    }
}

pub fn parse_rows(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split(FIELD_SEPARATOR).map(|f| f.trim().to_string()).collect())
        .collect()
}

fn parse_field<T: std::str::FromStr>(row: &[String], index: usize, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = row
        .get(index)
        .ok_or_else(|| Error::Validation(format!("segment row {:?} has no {} column", row, name)))?;

    raw.parse()
        .map_err(|e| Error::Validation(format!("parsing {} {:?}: {}", name, raw, e)))
}

/// Parses rows of [`SEGMENT_CONFIGURATION_QUERY`].
pub fn parse_segments(rows: &[Vec<String>]) -> Result<Vec<SegConfig>> {
    rows.iter()
        .map(|row| {
            if row.len() != 6 {
                return Err(Error::Validation(format!(
                    "expected 6 columns in segment configuration row, got {:?}",
                    row
                )));
            }

            Ok(SegConfig {
                dbid: parse_field(row, 0, "dbid")?,
                content_id: parse_field(row, 1, "content")?,
                port: parse_field(row, 2, "port")?,
                hostname: row[3].clone(),
                data_dir: PathBuf::from(&row[4]),
                role: Role::parse(&row[5])?,
            })
        })
        .collect()
}

/// Inspects the running cluster whose coordinator listens on `port`.
pub async fn cluster_from_db(runner: &dyn CommandRunner, gphome: &Path, port: i32) -> Result<Cluster> {
    // Bootstrap with a coordinator-only placeholder so the psql wrapper has
    // an environment to run in.
    let placeholder = Cluster::new(vec![SegConfig {
        dbid: 1,
        content_id: -1,
        role: Role::Primary,
        port,
        hostname: "localhost".to_string(),
        data_dir: PathBuf::new(),
    }])?
    .with_gphome(gphome);

    let rows = Psql::new(&placeholder)?
        .query(runner, SEGMENT_CONFIGURATION_QUERY)
        .await
        .map_err(|e| e.context("retrieve source configuration"))?;

    let cluster = Cluster::new(parse_segments(&rows)?)?.with_gphome(gphome);
    let version = gp_version(runner, gphome).await?;
    Ok(cluster.with_version(version))
}

/// Parses `postgres (Greenplum Database) 6.20.0 build ...` into `6.20.0`.
pub fn parse_version(raw: &str) -> Result<String> {
    let invalid = || {
        Error::Validation(format!(
            "Greenplum version {:?} is not of the form \"postgres (Greenplum Database) #.#.#\"",
            raw
        ))
    };

    let rest = raw
        .trim()
        .split_once("postgres (Greenplum Database) ")
        .map(|(_, rest)| rest)
        .ok_or_else(invalid)?;

    let re = Regex::new(r"\d+\.\d+\.\d+").map_err(|e| Error::Validation(e.to_string()))?;
    re.find(rest).map(|m| m.as_str().to_string()).ok_or_else(invalid)
}

pub fn major_version(version: &str) -> Result<u32> {
    version
        .split('.')
        .next()
        .and_then(|m| m.parse().ok())
        .ok_or_else(|| Error::Validation(format!("invalid version {:?}", version)))
}

/// Version of the installation at `gphome`, from `postgres --gp-version`.
pub async fn gp_version(runner: &dyn CommandRunner, gphome: &Path) -> Result<String> {
    let cmd = Command::new(gphome.join("bin").join("postgres").display().to_string())
        .arg("--gp-version")
        .env_clear_with(Vec::<(String, String)>::new());

    let output = runner.run(&cmd, None).await?;
    parse_version(&output.stdout_text())
}

/// The target installation must be a newer major version than the source.
pub fn check_versions(source: &str, target: &str) -> Result<()> {
    if major_version(target)? <= major_version(source)? {
        return Err(Error::Validation(format!(
            "target cluster version {} must be a newer major version than source cluster version {}",
            target, source
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{MockRunner, Output};

    const ROWS: &str = "\
1|-1|15432|mdw|/data/qddir/demoDataDir-1|p
8|-1|16432|smdw|/data/standby|m
2|0|25432|sdw1|/data/primary/demoDataDir0|p
4|0|25434|sdw2|/data/mirror/demoDataDir0|m
";

    #[test]
    fn test_parse_segments() {
        let segs = parse_segments(&parse_rows(ROWS)).unwrap();
        assert_eq!(segs.len(), 4);
        assert!(segs[0].is_coordinator());
        assert!(segs[1].is_standby());
        assert_eq!(segs[2].data_dir, PathBuf::from("/data/primary/demoDataDir0"));
        assert!(segs[3].is_mirror());
    }

    #[test]
    fn test_parse_segments_rejects_short_rows() {
        assert!(parse_segments(&parse_rows("1|-1|15432\n")).is_err());
        assert!(parse_segments(&parse_rows("x|-1|1|h|/d|p\n")).is_err());
        assert!(parse_segments(&parse_rows("1|-1|1|h|/d|q\n")).is_err());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("postgres (Greenplum Database) 6.20.3 build commit:abc\n").unwrap(),
            "6.20.3"
        );
        assert!(parse_version("postgres (PostgreSQL) 12.1").is_err());
        assert_eq!(major_version("7.0.0").unwrap(), 7);
    }

    #[test]
    fn test_check_versions() {
        assert!(check_versions("6.20.0", "7.1.0").is_ok());
        assert!(check_versions("6.20.0", "6.25.0").is_err());
    }

    #[tokio::test]
    async fn test_cluster_from_db() {
        let runner = MockRunner::new(|cmd| {
            if cmd.program.ends_with("postgres") {
                Output::success("postgres (Greenplum Database) 6.20.0 build dev")
            } else {
                Output::success(ROWS)
            }
        });

        let cluster = cluster_from_db(&runner, Path::new("/usr/local/gpdb6"), 15432)
            .await
            .unwrap();

        assert_eq!(cluster.version, "6.20.0");
        assert_eq!(cluster.coordinator_port().unwrap(), 15432);
        assert!(cluster.has_standby());
        assert_eq!(runner.calls_matching("gp_segment_configuration").len(), 1);
    }

    #[test]
    fn test_pgoptions() {
        let cluster = crate::cluster::tests::mirrored_cluster();
        let cmd = Psql::new(&cluster)
            .unwrap()
            .with_utility_mode()
            .with_system_table_mods()
            .command("SELECT 1")
            .unwrap();

        assert!(cmd.env.contains(&(
            "PGOPTIONS".to_string(),
            "-c gp_role=utility -c allow_system_table_mods=true".to_string()
        )));
    }
}
