use std::fmt;
use std::io::{self, Write};

use parking_lot::Mutex;

/// Shared destination for rendered reports.
///
/// Each report is written and flushed under one lock, so reports from
/// concurrent breakpoint workers never interleave.
pub struct ReportSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ReportSink {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn write_report(&self, text: &str) -> io::Result<()> {
        let mut out = self.out.lock();
        out.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            out.write_all(b"\n")?;
        }
        out.flush()
    }
}

impl fmt::Debug for ReportSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportSink").finish_non_exhaustive()
    }
}
