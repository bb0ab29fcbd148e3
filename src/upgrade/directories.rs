//! Data-directory naming and the guarded rename/delete helpers used by the
//! agents and by the hub on the coordinator host.

use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorList, Result};
use crate::step::stream::OutStreams;
use crate::upgrade::UpgradeId;

pub const OLD_SUFFIX: &str = ".old";
pub const PG_VERSION: &str = "PG_VERSION";

/// Files every postgres data directory contains.
pub const POSTGRES_FILES: &[&str] = &["postgresql.conf", PG_VERSION];

/// Files that identify a gpupgrade state directory.
pub const STATE_DIRECTORY_FILES: &[&str] = &["config.json", "steps.json"];

/// Per-segment scratch directory for pg_upgrade.
pub fn segment_working_directory(state_dir: &Path, content_id: i32) -> PathBuf {
    state_dir.join("pg_upgrade").join(format!("seg{}", content_id))
}

pub fn coordinator_working_directory(state_dir: &Path) -> PathBuf {
    segment_working_directory(state_dir, -1)
}

/// Temporary target data directory next to `datadir`.
///
/// `/data/primary/demoDataDir0` with prefix `demoDataDir` becomes
/// `/data/primary/demoDataDir.<id>.0`. A basename without the prefix (as
/// standbys often have) just gets `.<id>` appended.
pub fn temp_data_dir(datadir: &Path, seg_prefix: &str, id: UpgradeId) -> PathBuf {
    let parent = datadir.parent().map(Path::to_path_buf).unwrap_or_default();
    let base = datadir
        .file_name()
        .map(|b| b.to_string_lossy().into_owned())
        .unwrap_or_default();

    let new_base = match base.strip_prefix(seg_prefix) {
        Some(suffix) if !seg_prefix.is_empty() => format!("{}.{}.{}", seg_prefix, id, suffix),
        _ => format!("{}.{}", base, id),
    };

    parent.join(new_base)
}

/// Segment prefix derived from the coordinator data directory, whose
/// basename must end in `-1`.
pub fn coordinator_seg_prefix(datadir: &Path) -> Result<String> {
    let base = datadir
        .file_name()
        .map(|b| b.to_string_lossy().into_owned())
        .unwrap_or_default();

    let prefix = base.strip_suffix("-1").ok_or_else(|| {
        Error::Validation(format!(
            "path requires a coordinator content identifier: {:?}",
            datadir
        ))
    })?;

    if prefix.is_empty() {
        return Err(Error::Validation(format!(
            "path has no segment prefix: {:?}",
            datadir
        )));
    }

    Ok(prefix.to_string())
}

/// Appends `suffix` to the final path component.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Checks that `path` contains every file in [`POSTGRES_FILES`].
pub fn verify_data_directory(path: &Path) -> Result<()> {
    POSTGRES_FILES
        .iter()
        .filter(|f| !path.join(f).exists())
        .map(|f| Error::InvalidDataDirectory {
            path: path.to_path_buf(),
            file: f.to_string(),
        })
        .collect::<ErrorList>()
        .into_result()
}

fn rename_data_directory(src: &Path, dst: &Path) -> Result<()> {
    verify_data_directory(src)?;
    std::fs::rename(src, dst)
        .map_err(|e| Error::io(format!("renaming {:?} to {:?}", src, dst), e))
}

/// Archives `source` as `<target>.old` and, when `rename_target` is set,
/// moves `target` into the place `source` occupied.
///
/// Safe to call again after a partial or complete earlier run.
pub fn archive_source(source: &Path, target: &Path, rename_target: bool) -> Result<()> {
    let archive = with_suffix(target, OLD_SUFFIX);
    if archive.exists() && !target.exists() {
        return Ok(());
    }

    if source.exists() {
        rename_data_directory(source, &archive)?;
    }

    if !rename_target {
        return Ok(());
    }

    rename_data_directory(target, source)
}

/// Deletes each directory that contains every `required` file.
///
/// Directories that don't exist are skipped. A directory missing any
/// required file is left untouched and reported as [`Error::FileMissing`].
pub fn delete_directories(
    dirs: &[PathBuf],
    required: &[String],
    hostname: &str,
    streams: &dyn OutStreams,
) -> Result<()> {
    let mut errs = ErrorList::new();

    for dir in dirs {
        streams
            .print(&format!("Deleting directory: {:?} on host {:?}\n", dir, hostname))
            .map_err(|e| Error::io("writing output", e))?;

        if !dir.exists() {
            streams
                .print(&format!("directory: {:?} does not exist on host {:?}\n", dir, hostname))
                .map_err(|e| Error::io("writing output", e))?;
            continue;
        }

        let missing: Vec<&String> = required.iter().filter(|f| !dir.join(f).exists()).collect();
        if !missing.is_empty() {
            for file in missing {
                errs.push(Error::FileMissing {
                    dir: dir.clone(),
                    file: file.clone(),
                });
            }
            continue;
        }

        if let Err(e) = std::fs::remove_dir_all(dir) {
            errs.push(Error::io(format!("removing {:?}", dir), e));
        }
    }

    errs.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::stream::DevNullStream;
    use proptest::prelude::*;

    fn make_datadir(path: &Path) {
        std::fs::create_dir_all(path).unwrap();
        for f in POSTGRES_FILES {
            std::fs::write(path.join(f), "").unwrap();
        }
    }

    #[test]
    fn test_temp_data_dir() {
        let id = UpgradeId::from_raw(0);
        assert_eq!(
            temp_data_dir(Path::new("/data/primary/demoDataDir0"), "demoDataDir", id),
            PathBuf::from("/data/primary/demoDataDir.AAAAAAAAAAA.0")
        );
        assert_eq!(
            temp_data_dir(Path::new("/data/qddir/demoDataDir-1/"), "demoDataDir", id),
            PathBuf::from("/data/qddir/demoDataDir.AAAAAAAAAAA.-1")
        );
        assert_eq!(
            temp_data_dir(Path::new("/data/standby"), "demoDataDir", id),
            PathBuf::from("/data/standby.AAAAAAAAAAA")
        );
    }

    #[test]
    fn test_coordinator_seg_prefix() {
        assert_eq!(
            coordinator_seg_prefix(Path::new("/data/qddir/gpseg-1")).unwrap(),
            "gpseg"
        );
        assert!(coordinator_seg_prefix(Path::new("/data/qddir/gpseg0")).is_err());
        assert!(coordinator_seg_prefix(Path::new("/data/-1")).is_err());
    }

    #[test]
    fn test_archive_source_swaps_directories_once() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("demoDataDir0");
        let target = tmp.path().join("demoDataDir.ID.0");
        make_datadir(&source);
        make_datadir(&target);
        std::fs::write(target.join("marker"), "target").unwrap();

        archive_source(&source, &target, true).unwrap();
        assert!(tmp.path().join("demoDataDir.ID.0.old").exists());
        assert!(source.join("marker").exists());
        assert!(!target.exists());

        archive_source(&source, &target, true).unwrap();
        assert!(source.join("marker").exists());
    }

    #[test]
    fn test_archive_source_rejects_non_datadir() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("src");
        std::fs::create_dir(&source).unwrap();

        let err = archive_source(&source, &tmp.path().join("dst"), false).unwrap_err();
        assert_eq!(err.as_multi().map(|l| l.len()), Some(2));
        assert!(source.exists());
    }

    #[test]
    fn test_delete_directories_skips_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = vec![tmp.path().join("nope")];
        delete_directories(&dirs, &[], "localhost", &DevNullStream).unwrap();
    }

    fn required() -> Vec<String> {
        POSTGRES_FILES.iter().map(|s| s.to_string()).collect()
    }

    proptest! {
        #[test]
        fn prop_delete_only_with_all_required_files(present in proptest::collection::vec(any::<bool>(), 2)) {
            let tmp = tempfile::tempdir().unwrap();
            let dir = tmp.path().join("datadir");
            std::fs::create_dir(&dir).unwrap();
            for (file, keep) in POSTGRES_FILES.iter().zip(&present) {
                if *keep {
                    std::fs::write(dir.join(file), "").unwrap();
                }
            }

            let result = delete_directories(&[dir.clone()], &required(), "localhost", &DevNullStream);
            let all_present = present.iter().all(|p| *p);

            prop_assert_eq!(!dir.exists(), all_present);
            if all_present {
                prop_assert!(result.is_ok());
            } else {
                let missing = present.iter().filter(|p| !**p).count();
                let err = result.unwrap_err();
                let errors: Vec<&Error> = match err.as_multi() {
                    Some(list) => list.iter().collect(),
                    None => vec![&err],
                };
                prop_assert_eq!(errors.len(), missing);
                let all_missing = errors.iter().all(|e| matches!(e, Error::FileMissing { .. }));
                prop_assert!(all_missing);
            }
        }
    }
}
