// Purpose: Human-facing progress lines for pull/update.
// Inputs/Outputs: Plain messages in; one line per message on the sink, mirrored to tracing.
// Invariants: Lines from concurrent callers never interleave mid-line.

use std::io::{self, Write};

use parking_lot::Mutex;

pub struct Reporter {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter").finish_non_exhaustive()
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::stderr()
    }
}

impl Reporter {
    pub fn stderr() -> Self {
        Self::to_writer(io::stderr())
    }

    pub fn silent() -> Self {
        Self::to_writer(io::sink())
    }

    pub fn to_writer(w: impl Write + Send + 'static) -> Self {
        Self {
            sink: Mutex::new(Box::new(w)),
        }
    }

    pub fn report(&self, msg: &str) {
        tracing::info!("{msg}");
        let mut sink = self.sink.lock();
        if let Err(err) = writeln!(sink, "{msg}").and_then(|_| sink.flush()) {
            tracing::debug!(%err, "reporter sink write failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Write};
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// Cloneable in-memory sink for asserting on reported lines.
    #[derive(Clone, Default)]
    pub struct Captured(pub Arc<Mutex<Vec<u8>>>);

    impl Captured {
        pub fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock())
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
