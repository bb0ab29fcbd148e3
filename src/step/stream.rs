//! Output sinks for substep stdout/stderr.
//!
//! Substeps never write to the terminal directly. They write to an
//! [`OutStreams`] which, depending on who runs them, multiplexes output back
//! to the CLI over the phase stream, buffers it for verbose display, or drops
//! it.

use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use slog::{warn, Logger};

use crate::error::Result;
use crate::grpc::idl::{self, message::Contents, Chunk, Message, OutputStream};

pub trait OutStreams: Send + Sync {
    fn stdout(&self, buf: &[u8]) -> io::Result<()>;
    fn stderr(&self, buf: &[u8]) -> io::Result<()>;

    fn print(&self, text: &str) -> io::Result<()> {
        self.stdout(text.as_bytes())
    }

    fn eprint(&self, text: &str) -> io::Result<()> {
        self.stderr(text.as_bytes())
    }
}

/// Where the hub sends progress frames for the phase it is driving.
pub trait MessageSender: Send + Sync {
    fn send(&self, message: Message) -> Result<()>;
}

/// Discards everything.
pub struct DevNullStream;

impl OutStreams for DevNullStream {
    fn stdout(&self, _buf: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn stderr(&self, _buf: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Collects output in memory until the owner drains it.
#[derive(Default)]
pub struct BufferedStreams {
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl BufferedStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_stdout(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.stdout))
    }

    pub fn take_stderr(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.stderr))
    }
}

impl OutStreams for BufferedStreams {
    fn stdout(&self, buf: &[u8]) -> io::Result<()> {
        lock(&self.stdout).extend_from_slice(buf);
        Ok(())
    }

    fn stderr(&self, buf: &[u8]) -> io::Result<()> {
        lock(&self.stderr).extend_from_slice(buf);
        Ok(())
    }
}

/// Passes output straight through to this process's stdout/stderr.
pub struct StdStreams;

impl OutStreams for StdStreams {
    fn stdout(&self, buf: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(buf)?;
        out.flush()
    }

    fn stderr(&self, buf: &[u8]) -> io::Result<()> {
        io::stderr().lock().write_all(buf)
    }
}

/// Hub-side stream: every write goes to the phase log file and, as a
/// `Chunk` frame, to the CLI.
///
/// Once a send fails (the CLI went away) no further frames are attempted;
/// the log file still receives everything.
pub struct MultiplexedStream {
    sender: Arc<dyn MessageSender>,
    log: Mutex<Option<File>>,
    send_failed: AtomicBool,
    logger: Logger,
}

impl MultiplexedStream {
    pub fn new(sender: Arc<dyn MessageSender>, log: Option<File>, logger: Logger) -> Self {
        Self {
            sender,
            log: Mutex::new(log),
            send_failed: AtomicBool::new(false),
            logger,
        }
    }

    fn write(&self, stream: OutputStream, buf: &[u8]) -> io::Result<()> {
        if let Some(log) = lock(&self.log).as_mut() {
            log.write_all(buf)?;
        }

        if self.send_failed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let chunk = Chunk {
            stream: stream as i32,
            buffer: buf.to_vec(),
        };

        let message = Message {
            contents: Some(Contents::Chunk(chunk)),
        };

        if let Err(e) = self.sender.send(message) {
            warn!(self.logger, "halting client stream"; "error" => %e);
            self.send_failed.store(true, Ordering::SeqCst);
        }

        Ok(())
    }

    pub fn close(&self) -> io::Result<()> {
        if let Some(mut log) = lock(&self.log).take() {
            log.flush()?;
        }
        Ok(())
    }
}

impl OutStreams for MultiplexedStream {
    fn stdout(&self, buf: &[u8]) -> io::Result<()> {
        self.write(idl::OutputStream::Stdout, buf)
    }

    fn stderr(&self, buf: &[u8]) -> io::Result<()> {
        self.write(idl::OutputStream::Stderr, buf)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;

    /// Records sent messages; fails every send after `fail_after` successes.
    pub(crate) struct RecordingSender {
        pub messages: Mutex<Vec<Message>>,
        pub fail_after: Option<usize>,
    }

    impl RecordingSender {
        pub(crate) fn new() -> Self {
            Self {
                messages: Mutex::new(Vec::new()),
                fail_after: None,
            }
        }
    }

    impl MessageSender for RecordingSender {
        fn send(&self, message: Message) -> Result<()> {
            let mut messages = self.messages.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if messages.len() >= limit {
                    return Err(Error::Validation("stream closed".into()));
                }
            }
            messages.push(message);
            Ok(())
        }
    }

    #[test]
    fn test_buffered_streams() {
        let streams = BufferedStreams::new();
        streams.print("hello ").unwrap();
        streams.print("world").unwrap();
        streams.eprint("oops").unwrap();

        assert_eq!(streams.take_stdout(), b"hello world");
        assert_eq!(streams.take_stderr(), b"oops");
        assert!(streams.take_stdout().is_empty());
    }

    #[test]
    fn test_multiplexed_stream_sends_chunks_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("initialize.log");
        let file = File::create(&path).unwrap();

        let sender = Arc::new(RecordingSender::new());
        let stream = MultiplexedStream::new(sender.clone(), Some(file), crate::logging::discard());

        stream.stdout(b"out").unwrap();
        stream.stderr(b"err").unwrap();
        stream.close().unwrap();

        let messages = sender.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        match &messages[1].contents {
            Some(Contents::Chunk(chunk)) => {
                assert_eq!(chunk.stream(), OutputStream::Stderr);
                assert_eq!(chunk.buffer, b"err");
            }
            other => panic!("unexpected message {:?}", other),
        }

        assert_eq!(std::fs::read(&path).unwrap(), b"outerr");
    }

    #[test]
    fn test_multiplexed_stream_stops_sending_after_failure() {
        let sender = Arc::new(RecordingSender {
            messages: Mutex::new(Vec::new()),
            fail_after: Some(1),
        });
        let stream = MultiplexedStream::new(sender.clone(), None, crate::logging::discard());

        stream.stdout(b"a").unwrap();
        stream.stdout(b"b").unwrap();
        stream.stdout(b"c").unwrap();

        assert_eq!(sender.messages.lock().unwrap().len(), 1);
        assert!(stream.send_failed.load(Ordering::SeqCst));
    }
}
