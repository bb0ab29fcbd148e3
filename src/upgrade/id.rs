use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};

/// Identifier minted once per upgrade and appended to every temporary or
/// archived directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpgradeId(u64);

impl UpgradeId {
    pub fn new() -> Self {
        loop {
            let id = UpgradeId(rand::random::<u64>());
            // gpstart cannot handle "--" inside directory names.
            if !id.to_string().contains("--") {
                return id;
            }
        }
    }

    pub fn from_raw(raw: u64) -> Self {
        UpgradeId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UpgradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0.to_le_bytes()))
    }
}

/// Name of the directory that logs of this run are archived into.
pub fn archive_directory_name<Tz>(id: UpgradeId, at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    format!("gpupgrade-{}-{}", id, at.format("%Y-%m-%dT%H:%M"))
}
