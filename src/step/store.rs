//! Durable substep status, kept in `steps.json`.
//!
//! The document maps phase to substep to status:
//!
//! ```json
//! { "initialize": { "STEP_STATUS": "COMPLETE", "START_AGENTS": "COMPLETE" } }
//! ```
//!
//! Every write re-reads the whole document and replaces it atomically.
//! Keys this version does not understand are carried through untouched.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::config::atomic_write;
use crate::error::{Error, Result};
use crate::grpc::idl::{Status, Step, Substep};

pub fn phase_key(step: Step) -> String {
    step.as_str_name().to_ascii_lowercase()
}

fn parse_status(text: &str, path: &Path) -> Result<Status> {
    Status::from_str_name(text)
        .ok_or_else(|| Error::Config(format!("unknown status {:?} in {:?}", text, path)))
}

/// Status store over one JSON file. Clones share a write lock so writers
/// in the same process never interleave their read-modify-write cycles.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Opens the store, creating an empty document if none exists yet.
    /// The containing directory must already exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(path);
        if !store.path.exists() {
            atomic_write(&store.path, b"{}")?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Map<String, Value>> {
        let data = std::fs::read(&self.path)
            .map_err(|e| Error::io(format!("reading {:?}", self.path), e))?;

        match serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("parsing {:?}: {}", self.path, e)))?
        {
            Value::Object(map) => Ok(map),
            other => Err(Error::Config(format!(
                "{:?} does not hold a JSON object: {}",
                self.path, other
            ))),
        }
    }

    pub fn read(&self, step: Step, substep: Substep) -> Result<Status> {
        let doc = self.load()?;

        let value = doc
            .get(&phase_key(step))
            .and_then(|phase| phase.get(substep.as_str_name()));

        match value {
            None => Ok(Status::UnknownStatus),
            Some(Value::String(text)) => parse_status(text, &self.path),
            Some(other) => Err(Error::Config(format!(
                "status of {} in {:?} is not a string: {}",
                substep.as_str_name(),
                self.path,
                other
            ))),
        }
    }

    pub fn write(&self, step: Step, substep: Substep, status: Status) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        let mut doc = self.load()?;

        let phase = doc
            .entry(phase_key(step))
            .or_insert_with(|| Value::Object(Map::new()));

        if !phase.is_object() {
            *phase = Value::Object(Map::new());
        }
        if let Value::Object(substeps) = phase {
            substeps.insert(
                substep.as_str_name().to_string(),
                Value::String(status.as_str_name().to_string()),
            );
        }

        let data = serde_json::to_vec_pretty(&Value::Object(doc))?;
        atomic_write(&self.path, &data)
    }

    /// True once `substep` of `step` has any recorded status.
    pub fn has_run(&self, step: Step, substep: Substep) -> Result<bool> {
        Ok(self.read(step, substep)? != Status::UnknownStatus)
    }
}

/// Phase-level status: the `STEP_STATUS` pseudo-substep of each phase.
#[derive(Debug, Clone)]
pub struct StepStore {
    store: FileStore,
}

impl StepStore {
    pub fn new(store: FileStore) -> Self {
        Self { store }
    }

    pub fn read(&self, step: Step) -> Result<Status> {
        self.store.read(step, Substep::StepStatus)
    }

    pub fn write(&self, step: Step, status: Status) -> Result<()> {
        self.store.write(step, Substep::StepStatus, status)
    }

    pub fn file_store(&self) -> &FileStore {
        &self.store
    }
}
