//! Placement of the target cluster next to the source.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cluster::{Cluster, SegConfig, COORDINATOR_CONTENT};
use crate::error::{Error, Result};
use crate::upgrade::directories::coordinator_seg_prefix;
use crate::upgrade::{temp_data_dir, UpgradeId};

pub const DEFAULT_FIRST_PORT: u16 = 50432;

/// Where each target segment will live. Hosts and dbids match the source;
/// ports come from the temporary range and data directories are
/// temporary siblings of the source directories.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TargetLayout {
    pub coordinator: Option<SegConfig>,
    pub standby: Option<SegConfig>,
    pub primaries: Vec<SegConfig>,
    pub mirrors: Vec<SegConfig>,
}

impl TargetLayout {
    /// The cluster gpinitsystem creates: coordinator and primaries only.
    pub fn initial_cluster(&self) -> Result<Cluster> {
        let segments = self
            .coordinator
            .iter()
            .chain(self.primaries.iter())
            .cloned()
            .collect();
        Cluster::new(segments)
    }
}

/// Sorts and removes duplicates.
pub fn sanitize(mut ports: Vec<u16>) -> Vec<u16> {
    ports.sort_unstable();
    ports.dedup();
    ports
}

fn default_ports(source: &Cluster) -> Vec<u16> {
    // +2 for coordinator and standby
    let wanted = source.primaries().len() + source.mirrors().len() + 2;
    let available = (u16::MAX - DEFAULT_FIRST_PORT) as usize;
    (0..wanted.min(available))
        .map(|i| DEFAULT_FIRST_PORT + i as u16)
        .collect()
}

fn not_enough_ports() -> Error {
    Error::Validation("not enough ports".to_string())
}

struct PortAllocator<'a> {
    ports: &'a [u16],
    next: usize,
    by_host: HashMap<String, usize>,
}

impl<'a> PortAllocator<'a> {
    fn take_next(&mut self) -> Result<i32> {
        let port = *self.ports.get(self.next).ok_or_else(not_enough_ports)?;
        self.next += 1;
        Ok(port as i32)
    }

    /// The first segment on a host takes the next free port; later segments
    /// on that host continue from the host's previous port.
    fn take_for_host(&mut self, host: &str) -> Result<i32> {
        match self.by_host.get_mut(host) {
            Some(index) => {
                let port = *self.ports.get(*index).ok_or_else(not_enough_ports)?;
                *index += 1;
                Ok(port as i32)
            }
            None => {
                let port = *self.ports.get(self.next).ok_or_else(not_enough_ports)?;
                self.by_host.insert(host.to_string(), self.next + 1);
                Ok(port as i32)
            }
        }
    }
}

/// Assigns target ports and temporary data directories for every source
/// segment. An empty `ports` list means a default range starting at
/// [`DEFAULT_FIRST_PORT`].
pub fn assign_datadirs_and_ports(source: &Cluster, ports: &[u16], id: UpgradeId) -> Result<TargetLayout> {
    let ports = if ports.is_empty() {
        default_ports(source)
    } else {
        sanitize(ports.to_vec())
    };

    let mut alloc = PortAllocator {
        ports: &ports,
        next: 0,
        by_host: HashMap::new(),
    };
    let mut layout = TargetLayout::default();
    let mut seg_prefix = String::new();

    if let Some(coordinator) = source.coordinator() {
        let port = alloc.take_next()?;
        seg_prefix = coordinator_seg_prefix(&coordinator.data_dir)?;

        let mut seg = coordinator.clone();
        seg.port = port;
        seg.data_dir = temp_data_dir(&seg.data_dir, &seg_prefix, id);
        layout.coordinator = Some(seg);
    }

    if let Some(standby) = source.standby() {
        let mut seg = standby.clone();
        seg.port = alloc.take_next()?;
        seg.data_dir = temp_data_dir(&seg.data_dir, &seg_prefix, id);
        layout.standby = Some(seg);
    }

    let contents: Vec<i32> = source
        .content_ids()
        .iter()
        .copied()
        .filter(|&c| c != COORDINATOR_CONTENT)
        .collect();

    for content in &contents {
        if let Some(primary) = source.primary(*content) {
            let mut seg = primary.clone();
            seg.port = alloc.take_for_host(&seg.hostname)?;
            seg.data_dir = temp_data_dir(&seg.data_dir, &seg_prefix, id);
            layout.primaries.push(seg);
        }
    }

    for content in &contents {
        if let Some(mirror) = source.mirror(*content) {
            let mut seg = mirror.clone();
            seg.port = alloc.take_for_host(&seg.hostname)?;
            seg.data_dir = temp_data_dir(&seg.data_dir, &seg_prefix, id);
            layout.mirrors.push(seg);
        }
    }

    Ok(layout)
}
