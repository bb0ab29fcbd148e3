use std::path::Path;

use crate::error::{Error, Result};
use crate::step::stream::OutStreams;

/// Puts back the `pg_control` file that link-mode pg_upgrade renamed to
/// `pg_control.old`, making the source data directory startable again.
pub fn restore_pg_control(data_dir: &Path, streams: &dyn OutStreams) -> Result<()> {
    let global = data_dir.join("global");
    let src = global.join("pg_control.old");
    let dst = global.join("pg_control");

    let write_err = |e| Error::io("writing output", e);

    if !src.exists() && dst.exists() {
        streams
            .print(&format!("already renamed {:?} to {:?}\n", src, dst))
            .map_err(write_err)?;
        return Ok(());
    }

    streams
        .print(&format!("renaming {:?} to {:?}\n", src, dst))
        .map_err(write_err)?;

    std::fs::rename(&src, &dst).map_err(|e| Error::io(format!("renaming {:?} to {:?}", src, dst), e))
}
