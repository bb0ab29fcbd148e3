//! Cluster data model.
//!
//! A [`Cluster`] is the set of segments of one Greenplum installation. The
//! hub keeps two: the source cluster (inspected once during initialize) and
//! the target cluster (created by initialize). Segments reference each other
//! by content id only.

pub mod control;
pub mod inspect;
pub mod target;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const COORDINATOR_CONTENT: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "p")]
    Primary,
    #[serde(rename = "m")]
    Mirror,
}

impl Role {
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "p" => Ok(Role::Primary),
            "m" => Ok(Role::Mirror),
            other => Err(Error::Validation(format!("unknown segment role {:?}", other))),
        }
    }

    /// The role as recorded in `gp_segment_configuration`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "p",
            Role::Mirror => "m",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegConfig {
    pub dbid: i32,
    pub content_id: i32,
    pub role: Role,
    pub port: i32,
    pub hostname: String,
    pub data_dir: PathBuf,
}

impl SegConfig {
    pub fn is_coordinator(&self) -> bool {
        self.content_id == COORDINATOR_CONTENT && self.role == Role::Primary
    }

    pub fn is_standby(&self) -> bool {
        self.content_id == COORDINATOR_CONTENT && self.role == Role::Mirror
    }

    pub fn is_primary(&self) -> bool {
        self.content_id != COORDINATOR_CONTENT && self.role == Role::Primary
    }

    pub fn is_mirror(&self) -> bool {
        self.content_id != COORDINATOR_CONTENT && self.role == Role::Mirror
    }

    pub fn is_on_host(&self, hostname: &str) -> bool {
        self.hostname == hostname
    }
}

/// Serialized form of a [`Cluster`]; validated on the way back in.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClusterRecord {
    gphome: PathBuf,
    #[serde(default)]
    version: String,
    segments: Vec<SegConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ClusterRecord", into = "ClusterRecord")]
pub struct Cluster {
    /// Content ids in the order segments were supplied.
    content_ids: Vec<i32>,
    primaries: BTreeMap<i32, SegConfig>,
    mirrors: BTreeMap<i32, SegConfig>,
    /// Installation directory (contains `bin/` and `greenplum_path.sh`).
    pub gphome: PathBuf,
    pub version: String,
}

impl TryFrom<ClusterRecord> for Cluster {
    type Error = Error;

    fn try_from(record: ClusterRecord) -> Result<Self> {
        let mut cluster = Cluster::new(record.segments)?;
        cluster.gphome = record.gphome;
        cluster.version = record.version;
        Ok(cluster)
    }
}

impl From<Cluster> for ClusterRecord {
    fn from(cluster: Cluster) -> Self {
        ClusterRecord {
            segments: cluster.segments(),
            gphome: cluster.gphome,
            version: cluster.version,
        }
    }
}

fn invalid(seg: &SegConfig, msg: String) -> Error {
    Error::Validation(format!("invalid segment configuration ({:?}): {}", seg, msg))
}

impl Cluster {
    /// Build and validate a cluster from its segment rows.
    pub fn new(segments: Vec<SegConfig>) -> Result<Self> {
        let mut cluster = Cluster {
            content_ids: Vec::new(),
            primaries: BTreeMap::new(),
            mirrors: BTreeMap::new(),
            gphome: PathBuf::new(),
            version: String::new(),
        };

        let mut dbids = BTreeSet::new();
        let mut locations = BTreeSet::new();

        for seg in segments {
            if !dbids.insert(seg.dbid) {
                return Err(invalid(&seg, format!("duplicate dbid {}", seg.dbid)));
            }

            if !locations.insert((seg.hostname.clone(), seg.data_dir.clone())) {
                return Err(invalid(
                    &seg,
                    format!("data directory {:?} already used on host {:?}", seg.data_dir, seg.hostname),
                ));
            }

            if seg.is_coordinator() && seg.dbid != 1 {
                return Err(invalid(&seg, "coordinator must have dbid 1".to_string()));
            }

            let content = seg.content_id;
            match seg.role {
                Role::Primary => {
                    if cluster.primaries.contains_key(&content) {
                        return Err(invalid(
                            &seg,
                            format!("multiple primaries with content ID {}", content),
                        ));
                    }
                    cluster.content_ids.push(content);
                    cluster.primaries.insert(content, seg);
                }
                Role::Mirror => {
                    if cluster.mirrors.contains_key(&content) {
                        return Err(invalid(
                            &seg,
                            format!("multiple mirrors with content ID {}", content),
                        ));
                    }
                    cluster.mirrors.insert(content, seg);
                }
            }
        }

        for seg in cluster.mirrors.values() {
            if !cluster.primaries.contains_key(&seg.content_id) {
                return Err(invalid(
                    seg,
                    format!("mirror with content ID {} has no primary", seg.content_id),
                ));
            }
        }

        Ok(cluster)
    }

    pub fn with_gphome(mut self, gphome: impl Into<PathBuf>) -> Self {
        self.gphome = gphome.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.gphome.join("bin")
    }

    /// All segments, primaries before mirrors within each content id.
    pub fn segments(&self) -> Vec<SegConfig> {
        self.select_segments(|_| true)
    }

    pub fn content_ids(&self) -> &[i32] {
        &self.content_ids
    }

    pub fn primaries(&self) -> &BTreeMap<i32, SegConfig> {
        &self.primaries
    }

    pub fn mirrors(&self) -> &BTreeMap<i32, SegConfig> {
        &self.mirrors
    }

    pub fn primary(&self, content: i32) -> Option<&SegConfig> {
        self.primaries.get(&content)
    }

    pub fn mirror(&self, content: i32) -> Option<&SegConfig> {
        self.mirrors.get(&content)
    }

    pub fn coordinator(&self) -> Option<&SegConfig> {
        self.primaries.get(&COORDINATOR_CONTENT)
    }

    fn require_coordinator(&self) -> Result<&SegConfig> {
        self.coordinator()
            .ok_or_else(|| Error::Validation("cluster has no coordinator".to_string()))
    }

    pub fn coordinator_data_dir(&self) -> Result<&Path> {
        Ok(&self.require_coordinator()?.data_dir)
    }

    pub fn coordinator_port(&self) -> Result<i32> {
        Ok(self.require_coordinator()?.port)
    }

    pub fn coordinator_hostname(&self) -> Result<&str> {
        Ok(&self.require_coordinator()?.hostname)
    }

    pub fn standby(&self) -> Option<&SegConfig> {
        self.mirrors.get(&COORDINATOR_CONTENT)
    }

    pub fn has_standby(&self) -> bool {
        self.standby().is_some()
    }

    pub fn has_mirrors(&self) -> bool {
        self.mirrors.keys().any(|&content| content != COORDINATOR_CONTENT)
    }

    /// Every primary (coordinator included) has a mirror (standby included).
    pub fn has_all_mirrors_and_standby(&self) -> bool {
        self.primaries
            .keys()
            .all(|content| self.mirrors.contains_key(content))
    }

    /// Segments matching `selector`, in content-id order; a primary precedes
    /// its mirror.
    pub fn select_segments<F>(&self, selector: F) -> Vec<SegConfig>
    where
        F: Fn(&SegConfig) -> bool,
    {
        let mut matches = Vec::new();
        for content in &self.content_ids {
            if let Some(seg) = self.primaries.get(content) {
                if selector(seg) {
                    matches.push(seg.clone());
                }
            }
            if let Some(seg) = self.mirrors.get(content) {
                if selector(seg) {
                    matches.push(seg.clone());
                }
            }
        }
        matches
    }

    /// Hosts running primary segments, excluding the coordinator.
    pub fn primary_hostnames(&self) -> Vec<String> {
        self.primaries
            .values()
            .filter(|s| s.is_primary())
            .map(|s| s.hostname.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Hosts that need an agent: every host with a non-coordinator segment,
    /// plus the standby host.
    pub fn agent_hosts(&self) -> Vec<String> {
        self.segments()
            .into_iter()
            .filter(|s| !s.is_coordinator())
            .map(|s| s.hostname)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Load a cluster snapshot written by [`Cluster::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| Error::io(format!("reading cluster snapshot {:?}", path), e))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        crate::config::atomic_write(path, &data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn seg(dbid: i32, content: i32, role: Role, host: &str, port: i32, dir: &str) -> SegConfig {
        SegConfig {
            dbid,
            content_id: content,
            role,
            port,
            hostname: host.to_string(),
            data_dir: PathBuf::from(dir),
        }
    }

    /// Coordinator + standby, two hosts with one primary and one mirror each.
    pub(crate) fn mirrored_cluster() -> Cluster {
        Cluster::new(vec![
            seg(1, -1, Role::Primary, "mdw", 15432, "/data/qddir/demoDataDir-1"),
            seg(8, -1, Role::Mirror, "smdw", 16432, "/data/standby/demoDataDir-1"),
            seg(2, 0, Role::Primary, "sdw1", 25432, "/data/primary/demoDataDir0"),
            seg(3, 1, Role::Primary, "sdw2", 25433, "/data/primary/demoDataDir1"),
            seg(4, 0, Role::Mirror, "sdw2", 25434, "/data/mirror/demoDataDir0"),
            seg(5, 1, Role::Mirror, "sdw1", 25435, "/data/mirror/demoDataDir1"),
        ])
        .unwrap()
        .with_gphome("/usr/local/gpdb6")
        .with_version("6.20.0")
    }

    #[test]
    fn test_accessors() {
        let cluster = mirrored_cluster();

        assert_eq!(cluster.coordinator_port().unwrap(), 15432);
        assert_eq!(cluster.coordinator_hostname().unwrap(), "mdw");
        assert!(cluster.has_standby());
        assert!(cluster.has_mirrors());
        assert!(cluster.has_all_mirrors_and_standby());
        assert_eq!(cluster.primary_hostnames(), vec!["sdw1", "sdw2"]);
        assert_eq!(cluster.agent_hosts(), vec!["sdw1", "sdw2", "smdw"]);
        assert_eq!(cluster.bin_dir(), PathBuf::from("/usr/local/gpdb6/bin"));
    }

    #[test]
    fn test_select_segments_orders_primary_before_mirror() {
        let cluster = mirrored_cluster();
        let on_sdw1: Vec<i32> = cluster
            .select_segments(|s| s.is_on_host("sdw1"))
            .iter()
            .map(|s| s.dbid)
            .collect();
        assert_eq!(on_sdw1, vec![2, 5]);
    }

    #[test]
    fn test_rejects_duplicate_primary() {
        let result = Cluster::new(vec![
            seg(1, -1, Role::Primary, "mdw", 1, "/a"),
            seg(2, 0, Role::Primary, "sdw1", 2, "/b"),
            seg(3, 0, Role::Primary, "sdw2", 3, "/c"),
        ]);
        assert!(result.unwrap_err().to_string().contains("multiple primaries"));
    }

    #[test]
    fn test_rejects_orphan_mirror() {
        let result = Cluster::new(vec![
            seg(1, -1, Role::Primary, "mdw", 1, "/a"),
            seg(2, 0, Role::Mirror, "sdw1", 2, "/b"),
        ]);
        assert!(result.unwrap_err().to_string().contains("has no primary"));
    }

    #[test]
    fn test_rejects_shared_data_directory() {
        let result = Cluster::new(vec![
            seg(1, -1, Role::Primary, "mdw", 1, "/a"),
            seg(2, 0, Role::Primary, "mdw", 2, "/a"),
        ]);
        assert!(result.unwrap_err().to_string().contains("already used"));
    }

    #[test]
    fn test_rejects_coordinator_with_wrong_dbid() {
        let result = Cluster::new(vec![seg(7, -1, Role::Primary, "mdw", 1, "/a")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_snapshot_round_trip_revalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source_cluster_config.json");

        let cluster = mirrored_cluster();
        cluster.save(&path).unwrap();
        assert_eq!(Cluster::load(&path).unwrap(), cluster);

        std::fs::write(
            &path,
            r#"{"gphome": "/g", "segments": [
                {"dbid": 2, "content_id": 0, "role": "m", "port": 1, "hostname": "h", "data_dir": "/d"}
            ]}"#,
        )
        .unwrap();
        assert!(Cluster::load(&path).is_err());
    }
}
