//! Free-space checks for the filesystems holding cluster data.
//!
//! Required space is computed against `used + available`, so blocks reserved
//! for the superuser never count as free.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::sys::statvfs::statvfs;

use crate::error::{Error, Result};
use crate::grpc::idl::DiskUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsUsage {
    /// Bytes in use.
    pub used: u64,
    /// Bytes available to unprivileged users.
    pub avail: u64,
}

/// Filesystem queries, replaceable for tests.
pub trait Disk: Send + Sync {
    /// Mount points of every mounted filesystem.
    fn filesystems(&self) -> Result<Vec<PathBuf>>;
    fn usage(&self, path: &Path) -> Result<FsUsage>;
    /// Device id of the filesystem containing `path`.
    fn device(&self, path: &Path) -> Result<u64>;
}

/// Failures keyed by filesystem mount point.
pub type SpaceFailures = BTreeMap<String, DiskUsage>;

/// Report every filesystem under `paths` whose available space is below
/// `ratio` of its usable size. Each filesystem appears at most once.
pub fn check_usage(disk: &dyn Disk, ratio: f64, paths: &[PathBuf]) -> Result<SpaceFailures> {
    let mut mounts_by_device: HashMap<u64, String> = HashMap::new();
    for mount in disk.filesystems()? {
        // Unreadable mounts (fuse, permission-denied) cannot hold our data.
        if let Ok(dev) = disk.device(&mount) {
            mounts_by_device
                .entry(dev)
                .or_insert_with(|| mount.to_string_lossy().into_owned());
        }
    }

    let mut failures = SpaceFailures::new();
    for path in paths {
        let usage = disk.usage(path)?;

        let total = usage.used + usage.avail;
        let required = (ratio * total as f64) as u64;

        if usage.avail >= required {
            continue;
        }

        let dev = disk.device(path)?;
        let fs = mounts_by_device
            .get(&dev)
            .cloned()
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        failures.insert(
            fs,
            DiskUsage {
                available: usage.avail,
                required,
            },
        );
    }

    Ok(failures)
}

/// The real filesystem, via `/proc/self/mounts` and `statvfs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDisk;

impl Disk for LocalDisk {
    fn filesystems(&self) -> Result<Vec<PathBuf>> {
        let mounts = std::fs::read_to_string("/proc/self/mounts")
            .map_err(|e| Error::io("enumerating filesystems", e))?;

        Ok(mounts
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(|field| PathBuf::from(unescape_mount_path(field)))
            .collect())
    }

    fn usage(&self, path: &Path) -> Result<FsUsage> {
        let stat = statvfs(path).map_err(|e| {
            Error::io(format!("getting filesystem usage for {:?}", path), e.into())
        })?;

        // `fsblkcnt_t` is narrower than u64 on some platforms.
        #[allow(clippy::useless_conversion)]
        let (blocks, free, avail) = (
            u64::from(stat.blocks()),
            u64::from(stat.blocks_free()),
            u64::from(stat.blocks_available()),
        );
        let frsize = u64::from(stat.fragment_size());
        Ok(FsUsage {
            used: blocks.saturating_sub(free) * frsize,
            avail: avail * frsize,
        })
    }

    fn device(&self, path: &Path) -> Result<u64> {
        std::fs::metadata(path)
            .map(|m| m.dev())
            .map_err(|e| Error::io(format!("stat'ing {:?}", path), e))
    }
}

/// `/proc/mounts` escapes space, tab, newline and backslash as octal.
fn unescape_mount_path(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|octal| u8::from_str_radix(octal, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// One filesystem that lacks space on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceFailure {
    pub host: String,
    pub filesystem: String,
    pub available: u64,
    pub required: u64,
}

/// Typed disk-space failure; renders as a table sorted by host then
/// filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpaceError {
    failures: Vec<SpaceFailure>,
}

impl DiskSpaceError {
    pub fn new(mut failures: Vec<SpaceFailure>) -> Self {
        failures.sort_by(|a, b| {
            a.host
                .cmp(&b.host)
                .then_with(|| a.filesystem.cmp(&b.filesystem))
        });
        Self { failures }
    }

    /// Tag each per-mount failure from `host`.
    pub fn from_host_failures<I>(failures: I) -> Self
    where
        I: IntoIterator<Item = (String, SpaceFailures)>,
    {
        let rows = failures
            .into_iter()
            .flat_map(|(host, failed)| {
                failed.into_iter().map(move |(fs, usage)| SpaceFailure {
                    host: host.clone(),
                    filesystem: fs,
                    available: usage.available,
                    required: usage.required,
                })
            })
            .collect();
        Self::new(rows)
    }

    pub fn failures(&self) -> &[SpaceFailure] {
        &self.failures
    }

    /// Header row followed by one row per failure.
    pub fn table(&self) -> Vec<Vec<String>> {
        let mut rows = vec![["Hostname", "Filesystem", "Shortfall", "Available", "Required"]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()];

        for f in &self.failures {
            rows.push(vec![
                f.host.clone(),
                f.filesystem.clone(),
                format_bytes(f.required.saturating_sub(f.available)),
                format_bytes(f.available),
                format_bytes(f.required),
            ]);
        }

        rows
    }
}

impl fmt::Display for DiskSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "You currently do not have enough disk space to run an upgrade.")?;
        writeln!(f)?;

        let table = self.table();
        let columns = table.first().map(|r| r.len()).unwrap_or(0);
        let widths: Vec<usize> = (0..columns)
            .map(|c| table.iter().map(|row| row[c].len()).max().unwrap_or(0))
            .collect();

        for row in &table {
            let mut line = String::new();
            for (c, cell) in row.iter().enumerate() {
                line.push_str(&format!("{:<width$}", cell, width = widths[c] + 2));
            }
            writeln!(f, "{}", line.trim_end())?;
        }

        Ok(())
    }
}

impl std::error::Error for DiskSpaceError {}

/// Human-readable binary size, four significant digits.
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64 / 1024.0;
    for unit in ["KiB", "MiB", "GiB", "TiB", "PiB"] {
        if value < 1024.0 {
            return format!("{} {}", format_significant(value, 4), unit);
        }
        value /= 1024.0;
    }
    format!("{} EiB", format_significant(value, 4))
}

/// Round to `digits` significant digits and drop trailing zeros.
fn format_significant(value: f64, digits: i32) -> String {
    if value == 0.0 {
        return "0".to_string();
    }

    let magnitude = value.abs().log10().floor() as i32;
    let decimals = (digits - 1 - magnitude).max(0) as usize;
    let text = format!("{:.*}", decimals, value);

    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    /// Mounts "/" (dev 1) and "/data" (dev 2); paths under /data map to 2.
    struct FakeDisk {
        usage: HashMap<u64, FsUsage>,
    }

    impl FakeDisk {
        fn dev_of(path: &Path) -> u64 {
            if path.starts_with("/data") {
                2
            } else {
                1
            }
        }
    }

    impl Disk for FakeDisk {
        fn filesystems(&self) -> Result<Vec<PathBuf>> {
            Ok(vec![PathBuf::from("/"), PathBuf::from("/data")])
        }

        fn usage(&self, path: &Path) -> Result<FsUsage> {
            Ok(self.usage[&Self::dev_of(path)])
        }

        fn device(&self, path: &Path) -> Result<u64> {
            Ok(Self::dev_of(path))
        }
    }

    #[test]
    fn test_failing_filesystem_reported_once() {
        let disk = FakeDisk {
            usage: HashMap::from([
                (1, FsUsage { used: GIB, avail: 9 * GIB }),
                (2, FsUsage { used: 9 * GIB, avail: GIB }),
            ]),
        };

        let paths = vec![
            PathBuf::from("/data/primary/gpseg0"),
            PathBuf::from("/data/primary/gpseg1"),
            PathBuf::from("/home/gpadmin"),
        ];

        let failures = check_usage(&disk, 0.5, &paths).unwrap();
        assert_eq!(failures.len(), 1);

        let usage = &failures["/data"];
        assert_eq!(usage.available, GIB);
        assert_eq!(usage.required, 5 * GIB);
    }

    #[test]
    fn test_ratio_zero_never_fails() {
        let disk = FakeDisk {
            usage: HashMap::from([(1, FsUsage { used: GIB, avail: 0 }), (2, FsUsage { used: GIB, avail: 0 })]),
        };
        let failures = check_usage(&disk, 0.0, &[PathBuf::from("/")]).unwrap();
        assert!(failures.is_empty());
    }

    #[test]
    fn test_local_disk_usage_of_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let usage = LocalDisk.usage(dir.path()).unwrap();
        assert!(usage.used + usage.avail > 0);
        assert!(LocalDisk.filesystems().unwrap().iter().any(|m| m == Path::new("/")));
    }

    #[test]
    fn test_local_disk_usage_of_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalDisk.usage(&dir.path().join("absent")).unwrap_err();
        assert_eq!(err.io_error().unwrap().kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_unescape_mount_path() {
        assert_eq!(unescape_mount_path("/mnt/my\\040disk"), "/mnt/my disk");
        assert_eq!(unescape_mount_path("/plain"), "/plain");
        assert_eq!(unescape_mount_path("/trailing\\"), "/trailing\\");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "0.5 KiB");
        assert_eq!(format_bytes(1024), "1 KiB");
        assert_eq!(format_bytes(1536 * 1024), "1.5 MiB");
        assert_eq!(format_bytes(10 * GIB), "10 GiB");
        assert_eq!(format_bytes(1000 * 1024 * 1024 + 12345), "1000 MiB");
        assert_eq!(format_bytes(123_456_789), "117.7 MiB");
    }

    #[test]
    fn test_table_sorted_by_host_then_filesystem() {
        let err = DiskSpaceError::new(vec![
            SpaceFailure {
                host: "sdw1".into(),
                filesystem: "/proc".into(),
                available: GIB,
                required: 2 * GIB,
            },
            SpaceFailure {
                host: "sdw1".into(),
                filesystem: "/".into(),
                available: GIB,
                required: 3 * GIB,
            },
            SpaceFailure {
                host: "mdw".into(),
                filesystem: "/".into(),
                available: 2 * GIB,
                required: 4 * GIB,
            },
        ]);

        let table = err.table();
        assert_eq!(
            table[0],
            vec!["Hostname", "Filesystem", "Shortfall", "Available", "Required"]
        );

        let keys: Vec<String> = table[1..]
            .iter()
            .map(|row| format!("{}{}", row[0], row[1]))
            .collect();
        assert_eq!(keys, vec!["mdw/", "sdw1/", "sdw1/proc"]);

        assert_eq!(table[1][2..], ["2 GiB", "2 GiB", "4 GiB"]);

        let rendered = err.to_string();
        assert!(rendered.starts_with("You currently do not have enough disk space"));
        assert!(rendered.contains("Hostname  Filesystem  Shortfall  Available  Required"));
    }
}
