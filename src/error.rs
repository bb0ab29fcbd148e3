//! Error taxonomy shared by the CLI, the hub and the agents.
//!
//! Every fallible operation in the crate returns [`Result`]. Concurrent work
//! aggregates its failures into an [`ErrorList`], which flattens nested lists
//! so that a fan-out across hosts that itself fans out across segments still
//! reports one flat list of failures.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::disk::DiskSpaceError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Phase ordering, flag combinations and config-file syntax.
    #[error("{0}")]
    Validation(String),

    #[error("{program} failed with exit code {code}: {stderr}")]
    Subprocess {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("agent on host {host:?}: {source}")]
    Agent {
        host: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    DiskSpace(#[from] DiskSpaceError),

    #[error(transparent)]
    Multi(#[from] ErrorList),

    #[error(transparent)]
    NextAction(#[from] NextActionErr),

    /// The operator answered "n" at the confirmation prompt.
    #[error("user canceled")]
    UserCanceled,

    /// A substep declared itself intentionally skipped.
    #[error("skipped")]
    Skip,

    /// The CLI went away while the hub was driving a phase.
    #[error("canceled by client")]
    Canceled,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{dir:?} is missing required file {file:?}")]
    FileMissing { dir: PathBuf, file: String },

    #[error("{path:?} does not look like a postgres directory. Failed to find {file:?}")]
    InvalidDataDirectory { path: PathBuf, file: String },

    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{}", .0.message())]
    Rpc(#[from] tonic::Status),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn agent(host: impl Into<String>, source: Error) -> Self {
        Error::Agent {
            host: host.into(),
            source: Box::new(source),
        }
    }

    pub fn subprocess(program: impl Into<String>, code: i32, stderr: impl Into<String>) -> Self {
        Error::Subprocess {
            program: program.into(),
            code,
            stderr: stderr.into(),
        }
    }

    /// Wrap with contextual text. The wrapped error keeps its identity: a
    /// wrapped [`ErrorList`] is not spliced when appended elsewhere.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Walks `Context` wrappers down to the innermost error.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self.root(), Error::Skip)
    }

    pub fn is_user_canceled(&self) -> bool {
        matches!(self.root(), Error::UserCanceled)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.root(), Error::Canceled)
    }

    pub fn as_multi(&self) -> Option<&ErrorList> {
        match self.root() {
            Error::Multi(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_next_action(&self) -> Option<&NextActionErr> {
        match self.root() {
            Error::NextAction(n) => Some(n),
            _ => None,
        }
    }

    /// The underlying filesystem error, if this is one.
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self.root() {
            Error::Io { source, .. } => Some(source),
            Error::Agent { source, .. } => source.io_error(),
            _ => None,
        }
    }

    /// Exit status of a failed subprocess, if this is one.
    pub fn exit_code(&self) -> Option<i32> {
        match self.root() {
            Error::Subprocess { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Rpc(status) => status,
            Error::Validation(msg) => tonic::Status::invalid_argument(msg),
            Error::Canceled => tonic::Status::cancelled("canceled by client"),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

/// A flattened list of errors collected from concurrent work.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<Error>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `err`, splicing in the members of an unwrapped list.
    pub fn push(&mut self, err: Error) {
        match err {
            Error::Multi(list) => self.errors.extend(list.errors),
            other => self.errors.push(other),
        }
    }

    pub fn push_result<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.push(err);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.errors.iter()
    }

    pub fn into_vec(self) -> Vec<Error> {
        self.errors
    }

    /// `Ok` when empty, the lone error when there is one, the list otherwise.
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Multi(self)),
        }
    }
}

impl FromIterator<Error> for ErrorList {
    fn from_iter<I: IntoIterator<Item = Error>>(iter: I) -> Self {
        let mut list = ErrorList::new();
        for err in iter {
            list.push(err);
        }
        list
    }
}

impl IntoIterator for ErrorList {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            return write!(f, "1 error occurred:\n\t* {}", self.errors[0]);
        }

        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}

/// Combine two optional errors. Lists are spliced; `None` inputs vanish.
/// Zero survivors give `None`, one gives that error unchanged.
pub fn append(a: Option<Error>, b: Option<Error>) -> Option<Error> {
    let list: ErrorList = a.into_iter().chain(b).collect();
    list.into_result().err()
}

/// An error decorated with guidance the CLI prints after the error text.
#[derive(Debug)]
pub struct NextActionErr {
    pub err: Box<Error>,
    pub next_action: String,
}

impl NextActionErr {
    pub fn new(err: Error, next_action: impl Into<String>) -> Self {
        Self {
            err: Box::new(err),
            next_action: next_action.into(),
        }
    }

    pub fn help(&self) -> String {
        format!("\nNEXT ACTIONS\n------------\n{}", self.next_action)
    }
}

impl fmt::Display for NextActionErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.err)
    }
}

impl std::error::Error for NextActionErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.err.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn err(text: &str) -> Error {
        Error::Validation(text.to_string())
    }

    fn texts(list: &ErrorList) -> Vec<String> {
        list.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn test_append_nils() {
        assert!(append(None, None).is_none());
    }

    #[test]
    fn test_append_single_error_is_unchanged() {
        let result = append(Some(err("boom")), None).unwrap();
        assert!(matches!(result, Error::Validation(ref s) if s == "boom"));

        let result = append(None, Some(err("boom"))).unwrap();
        assert!(matches!(result, Error::Validation(ref s) if s == "boom"));
    }

    #[test]
    fn test_append_splices_lists_in_order() {
        let first = append(Some(err("a")), Some(err("b"))).unwrap();
        let second = append(Some(err("c")), Some(err("d"))).unwrap();

        let combined = append(Some(first), Some(second)).unwrap();
        let list = combined.as_multi().expect("expected a list");
        assert_eq!(texts(list), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_wrapped_list_is_not_spliced() {
        let inner = append(Some(err("a")), Some(err("b"))).unwrap();
        let wrapped = inner.context("renaming");

        let combined = append(Some(err("x")), Some(wrapped)).unwrap();
        let list = combined.as_multi().unwrap();
        assert_eq!(list.len(), 2);

        let second = list.iter().nth(1).unwrap();
        assert_eq!(second.as_multi().unwrap().len(), 2);
        assert!(second.to_string().starts_with("renaming: 2 errors occurred"));
    }

    #[test]
    fn test_sentinels_survive_context() {
        assert!(Error::Skip.context("substep").is_skip());
        assert!(Error::UserCanceled.context("prompt").is_user_canceled());
        assert!(!err("x").is_skip());
    }

    #[test]
    fn test_display() {
        let list: ErrorList = vec![err("a"), err("b")].into_iter().collect();
        assert_eq!(list.to_string(), "2 errors occurred:\n\t* a\n\t* b");
    }

    #[test]
    fn test_next_action_help() {
        let e = NextActionErr::new(err("bad"), "run it again");
        assert_eq!(e.to_string(), "bad");
        assert_eq!(e.help(), "\nNEXT ACTIONS\n------------\nrun it again");
    }

    #[derive(Debug, Clone)]
    enum Input {
        Nil,
        Single(u8),
        List(Vec<u8>),
    }

    fn input() -> impl Strategy<Value = Input> {
        prop_oneof![
            Just(Input::Nil),
            any::<u8>().prop_map(Input::Single),
            proptest::collection::vec(any::<u8>(), 2..5).prop_map(Input::List),
        ]
    }

    proptest! {
        #[test]
        fn prop_flattening_keeps_non_nil_inputs_in_order(inputs in proptest::collection::vec(input(), 0..8)) {
            let mut expected = Vec::new();
            let mut list = ErrorList::new();

            for i in &inputs {
                match i {
                    Input::Nil => {}
                    Input::Single(n) => {
                        expected.push(n.to_string());
                        list.push(err(&n.to_string()));
                    }
                    Input::List(ns) => {
                        expected.extend(ns.iter().map(|n| n.to_string()));
                        let nested: ErrorList = ns.iter().map(|n| err(&n.to_string())).collect();
                        list.push(Error::Multi(nested));
                    }
                }
            }

            prop_assert_eq!(texts(&list), expected);
        }
    }
}
