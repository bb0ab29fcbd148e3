//! Renders a phase's progress stream on the terminal.

use std::collections::HashMap;

use futures::{Stream, StreamExt};

use crate::error::{Error, Result};
use crate::grpc::idl::{message::Contents, Message, OutputStream, Substep};
use crate::step::stream::OutStreams;
use crate::step::substeps::format_status;

/// Response key for the target coordinator's port.
pub const TARGET_PORT: &str = "target_port";
/// Response key for the target coordinator's data directory.
pub const TARGET_DATADIR: &str = "target_master_data_directory";

/// Consumes `stream` until it ends, printing substep status lines and, in
/// verbose mode, the raw output of every substep. Returns the merged
/// key/value data of every `Response` frame.
///
/// A stream ending in an error still yields the data received so far
/// alongside the error.
pub async fn ui_loop<S>(
    mut stream: S,
    verbose: bool,
    console: &dyn OutStreams,
) -> (HashMap<String, String>, Result<()>)
where
    S: Stream<Item = std::result::Result<Message, tonic::Status>> + Unpin,
{
    let mut data = HashMap::new();
    let mut last: Option<Substep> = None;

    let result: Result<()> = async {
        while let Some(message) = stream.next().await {
            match message?.contents {
                Some(Contents::Chunk(chunk)) => {
                    if !verbose {
                        continue;
                    }
                    match chunk.stream() {
                        OutputStream::Stdout => console.stdout(&chunk.buffer),
                        OutputStream::Stderr => console.stderr(&chunk.buffer),
                        OutputStream::UnknownOutput => Ok(()),
                    }
                    .map_err(|e| Error::io("writing substep output", e))?;
                }
                Some(Contents::Status(status)) => {
                    let substep = status.substep();
                    let mut line = String::new();

                    if !verbose {
                        match last {
                            None => {}
                            Some(prev) if prev == substep => line.push('\r'),
                            Some(_) => line.push('\n'),
                        }
                    }
                    line.push_str(&format_status(substep, status.status()));
                    if verbose {
                        line.push('\n');
                    }

                    last = Some(substep);
                    print(console, &line)?;
                }
                Some(Contents::Response(response)) => data.extend(response.data),
                None => {}
            }
        }
        Ok(())
    }
    .await;

    if !verbose {
        let _ = print(console, "\n");
    }

    (data, result)
}

fn print(console: &dyn OutStreams, text: &str) -> Result<()> {
    console.print(text).map_err(|e| Error::io("writing to terminal", e))
}

/// The target coordinator's port and data directory from a phase response.
pub fn target_info(data: &HashMap<String, String>) -> Result<(String, String)> {
    let port = data.get(TARGET_PORT).filter(|v| !v.is_empty());
    let datadir = data.get(TARGET_DATADIR).filter(|v| !v.is_empty());

    match (port, datadir) {
        (Some(port), Some(datadir)) => Ok((port.clone(), datadir.clone())),
        _ => {
            let mut missing = Vec::new();
            if port.is_none() {
                missing.push("target port");
            }
            if datadir.is_none() {
                missing.push("target datadir");
            }
            Err(Error::Validation(format!(
                "did not receive the expected configuration values: {}",
                missing.join(", ")
            )))
        }
    }
}
