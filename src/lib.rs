pub mod agent;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod daemon;
pub mod disk;
pub mod env;
pub mod error;
pub mod exec;
pub mod fanout;
pub mod grpc;
pub mod hub;
pub mod logging;
pub mod rsync;
pub mod step;
pub mod upgrade;

pub use cluster::{Cluster, Role, SegConfig};
pub use config::{HubConfig, Mode};
pub use env::Env;
pub use error::{Error, ErrorList, NextActionErr, Result};
pub use exec::{CommandRunner, MockRunner, ShellRunner};
pub use grpc::ServerHandle;
pub use hub::Hub;
