//! Building blocks of an upgrade that operate on a single host.

pub mod conf;
pub mod directories;
pub mod id;
pub mod pg_control;
pub mod pg_upgrade;

pub use directories::{
    archive_source, delete_directories, segment_working_directory, temp_data_dir,
    verify_data_directory, with_suffix, OLD_SUFFIX, POSTGRES_FILES, STATE_DIRECTORY_FILES,
};
pub use id::{archive_directory_name, UpgradeId};

use crate::error::{Error, Result};

/// Name of the host this process runs on.
pub fn hostname() -> Result<String> {
    gethostname::gethostname()
        .into_string()
        .map_err(|name| Error::Validation(format!("hostname {:?} is not valid UTF-8", name)))
}

/// Login name of the current user, as the database tools expect it.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "gpadmin".to_string())
}
