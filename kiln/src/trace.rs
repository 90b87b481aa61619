//! The user-visible job trace sink.
//!
//! The coordinator hands the executor an opaque byte writer that becomes the
//! job log shown to users. Many tasks write to it concurrently (the log
//! demultiplexer, the readiness watcher, the legacy exec driver), so the
//! handle serializes writes internally. The writer itself is foreign code:
//! panics it raises are caught here and downgraded to warnings so the
//! long-lived loops that hold a trace handle can never be torn down by it.

use std::io;
use std::io::Write;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::warn;

/// A cloneable, internally synchronized handle to the job trace.
#[derive(Clone)]
pub struct Trace {
    /// The coordinator-provided writer.
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Trace {
    /// Creates a trace over the given writer.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Writes raw bytes to the trace.
    ///
    /// A panicking writer is reported as a warning and treated as a
    /// successful write.
    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        match panic::catch_unwind(AssertUnwindSafe(|| writer.write_all(bytes))) {
            Ok(result) => result,
            Err(_) => {
                warn!("trace writer panicked; dropping {} bytes", bytes.len());
                Ok(())
            }
        }
    }

    /// Writes a line to the trace, appending a newline.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.write_all(&bytes)
    }

    /// Writes a user-facing progress message.
    ///
    /// Errors writing progress messages are not actionable and are only
    /// logged.
    pub fn message(&self, message: &str) {
        if let Err(e) = self.write_line(message) {
            warn!("error writing message to trace: {e}");
        }
    }

    /// Writes a user-facing warning and records it in the runner log.
    pub fn warning(&self, message: &str) {
        warn!("{message}");

        if let Err(e) = self.write_line(&format!("WARNING: {message}")) {
            warn!("error writing warning to trace: {e}");
        }
    }

    /// Writes a user-facing error and records it in the runner log.
    pub fn error(&self, message: &str) {
        tracing::error!("{message}");

        if let Err(e) = self.write_line(&format!("ERROR: {message}")) {
            warn!("error writing error to trace: {e}");
        }
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A writer sharing its buffer with the test for inspection.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(pub(crate) Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct PanickingWriter;

    impl Write for PanickingWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            panic!("writer is broken")
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lines_are_terminated() {
        let buffer = SharedBuffer::default();
        let trace = Trace::new(buffer.clone());

        trace.write_line("hello").unwrap();
        trace.write_line("world").unwrap();

        assert_eq!(buffer.contents(), "hello\nworld\n");
    }

    #[test]
    fn warnings_are_prefixed() {
        let buffer = SharedBuffer::default();
        let trace = Trace::new(buffer.clone());

        trace.warning("image pull is slow");

        assert_eq!(buffer.contents(), "WARNING: image pull is slow\n");
    }

    #[test]
    fn panicking_writer_does_not_propagate() {
        let trace = Trace::new(PanickingWriter);

        trace.write_line("lost").unwrap();
        trace.write_line("also lost").unwrap();
    }

    #[test]
    fn clones_share_the_sink() {
        let buffer = SharedBuffer::default();
        let trace = Trace::new(buffer.clone());

        trace.clone().write_line("one").unwrap();
        trace.write_line("two").unwrap();

        assert_eq!(buffer.contents(), "one\ntwo\n");
    }
}
