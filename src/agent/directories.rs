//! Directory handlers: creation, guarded deletion, the finalize renames and
//! log archiving.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorList, Result};
use crate::fanout;
use crate::step::stream::DevNullStream;
use crate::upgrade::{archive_source, delete_directories, STATE_DIRECTORY_FILES};

pub async fn create_data_directories(dirs: Vec<PathBuf>) -> Result<()> {
    fanout::for_each(dirs, |dir| async move {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(format!("creating {:?}", dir), e))?;

        tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| Error::io(format!("setting permissions on {:?}", dir), e))
    })
    .await
}

pub async fn delete_data_directories(dirs: Vec<PathBuf>, required: Vec<String>, hostname: String) -> Result<()> {
    tokio::task::spawn_blocking(move || delete_directories(&dirs, &required, &hostname, &DevNullStream)).await?
}

pub async fn delete_state_directory(state_dir: PathBuf, hostname: String) -> Result<()> {
    let required = STATE_DIRECTORY_FILES.iter().map(|f| f.to_string()).collect();
    delete_data_directories(vec![state_dir], required, hostname).await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePair {
    pub source: PathBuf,
    pub target: PathBuf,
    pub rename_target: bool,
}

/// Archives each source in order. The first failure stops the walk.
pub async fn rename_directories(pairs: Vec<RenamePair>) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        for pair in &pairs {
            archive_source(&pair.source, &pair.target, pair.rename_target)?;
        }
        Ok(())
    })
    .await?
}

/// Moves the log directory aside. A missing log directory is not an error.
pub async fn archive_log_directory(log_dir: &Path, new_dir: &Path) -> Result<()> {
    match tokio::fs::rename(log_dir, new_dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(format!("renaming {:?} to {:?}", log_dir, new_dir), e)),
    }
}

/// Moves tablespace directories into place. Every pair is attempted; both
/// the parent creation and the rename failure of a pair are reported.
pub async fn rename_tablespaces(hostname: &str, pairs: Vec<(PathBuf, PathBuf)>) -> Result<()> {
    fanout::for_each(pairs, |(source, destination)| async move {
        let mut errs = ErrorList::new();

        if let Some(parent) = destination.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                errs.push(Error::io(
                    format!("on host {:?}: creating {:?}", hostname, parent),
                    e,
                ));
            }
        }

        if let Err(e) = tokio::fs::rename(&source, &destination).await {
            errs.push(Error::io(
                format!("on host {:?}: renaming {:?} to {:?}", hostname, source, destination),
                e,
            ));
        }

        errs.into_result()
    })
    .await
}
