//! Edits to postgres configuration files: port rewrites, replication
//! entries in `pg_hba.conf` and streaming-replication settings for mirrors.
//!
//! Recovery settings use the PostgreSQL 12+ layout (`standby.signal` plus
//! `postgresql.auto.conf`), matching Greenplum 7 targets.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use regex::Regex;

use crate::error::{Error, Result};

pub const REPLICATION_SLOT: &str = "internal_wal_replication_slot";

fn port_regex(prefix: &str, old: i32) -> Result<Regex> {
    Regex::new(&format!(r"(?m)({}){}([^0-9]|$)", prefix, old))
        .map_err(|e| Error::Validation(format!("building port pattern: {}", e)))
}

/// Replaces a `port = <old>` assignment in postgresql.conf text.
pub fn rewrite_port(text: &str, old: i32, new: i32) -> Result<String> {
    let re = port_regex(r"^port[ \t]*=[ \t]*", old)?;
    Ok(re.replace_all(text, format!("${{1}}{}${{2}}", new)).into_owned())
}

/// Replaces the port inside a `primary_conninfo` line.
pub fn rewrite_conninfo_port(text: &str, old: i32, new: i32) -> Result<String> {
    let re = port_regex(r"^primary_conninfo .* port[ \t]*=[ \t]*", old)?;
    Ok(re.replace_all(text, format!("${{1}}{}${{2}}", new)).into_owned())
}

/// Rewrites `path` in place, leaving the previous contents in `<path>.bak`.
fn rewrite_file<F>(path: &Path, rewrite: F) -> Result<()>
where
    F: FnOnce(&str) -> Result<String>,
{
    let original = std::fs::read_to_string(path)
        .map_err(|e| Error::io(format!("reading {:?}", path), e))?;
    let updated = rewrite(&original)?;

    let backup = crate::upgrade::with_suffix(path, ".bak");
    std::fs::write(&backup, &original)
        .map_err(|e| Error::io(format!("writing {:?}", backup), e))?;

    crate::config::atomic_write(path, updated.as_bytes())
        .map_err(|e| e.context(format!("updating {:?}", path)))
}

pub fn update_port_in_file(path: &Path, old: i32, new: i32) -> Result<()> {
    rewrite_file(path, |text| rewrite_port(text, old, new))
}

pub fn update_conninfo_port_in_file(path: &Path, old: i32, new: i32) -> Result<()> {
    rewrite_file(path, |text| rewrite_conninfo_port(text, old, new))
}

/// `pg_hba.conf` lines allowing `user` to replicate from the local host
/// and to connect and replicate from every address in `host_addrs`.
pub fn replication_entries(user: &str, host_addrs: &[String]) -> String {
    let mut lines = format!("host replication {} samehost trust\n", user);
    for addr in host_addrs {
        lines.push_str(&format!("host all {} {} trust\n", user, addr));
        lines.push_str(&format!("host replication {} {} trust\n", user, addr));
    }
    lines
}

pub fn append_replication_entries(data_dir: &Path, user: &str, host_addrs: &[String]) -> Result<()> {
    let path = data_dir.join("pg_hba.conf");
    let mut file = OpenOptions::new()
        .append(true)
        .open(&path)
        .map_err(|e| Error::io(format!("opening {:?}", path), e))?;

    file.write_all(replication_entries(user, host_addrs).as_bytes())
        .map_err(|e| Error::io(format!("appending to {:?}", path), e))
}

pub fn recovery_settings(user: &str, primary_host: &str, primary_port: i32) -> String {
    format!(
        "primary_conninfo = 'user={} host={} port={} sslmode=disable sslcompression=0 \
         gssencmode=disable target_session_attrs=any application_name=gp_walreceiver'\n\
         primary_slot_name = '{}'\n",
        user, primary_host, primary_port, REPLICATION_SLOT
    )
}

/// Turns `mirror_dir` into a streaming standby of the given primary.
pub fn write_recovery_conf(mirror_dir: &Path, user: &str, primary_host: &str, primary_port: i32) -> Result<()> {
    let signal = mirror_dir.join("standby.signal");
    std::fs::write(&signal, b"").map_err(|e| Error::io(format!("writing {:?}", signal), e))?;

    let auto_conf = mirror_dir.join("postgresql.auto.conf");
    std::fs::write(&auto_conf, recovery_settings(user, primary_host, primary_port))
        .map_err(|e| Error::io(format!("writing {:?}", auto_conf), e))
}
