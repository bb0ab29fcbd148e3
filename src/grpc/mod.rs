//! Generated gRPC code and the connections the CLI and hub dial.

pub mod agents;
pub mod client;
pub mod server;

// Include the generated protobuf code
pub mod idl {
    tonic::include_proto!("gpupgrade");

    // File descriptor for gRPC reflection
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("gpupgrade_descriptor");
}

pub use agents::{AgentConn, AgentConnector, MappedAgentConnector, TcpAgentConnector};
pub use client::{connect_channel, connect_hub};
pub use server::ServerHandle;
