//! Chrome trace output.
//!
//! Load it in chrome://tracing or https://ui.perfetto.dev to see where a
//! startup or build spent its time.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_event(&mut self, name: &str, tid: usize, start: Instant, end: Instant) -> std::io::Result<()> {
        write!(
            self.w,
            "{{\"pid\":0, \"name\":{}, \"ts\":{}, \"tid\": {}, \"ph\":\"X\", \"dur\":{}}}",
            serde_json::Value::from(name),
            start.duration_since(self.start).as_micros(),
            tid,
            end.duration_since(start).as_micros()
        )
    }

    fn write_complete(&mut self, name: &str, tid: usize, start: Instant, end: Instant) -> std::io::Result<()> {
        self.write_event(name, tid, start, end)?;
        writeln!(self.w, ",")
    }

    fn close(&mut self) -> std::io::Result<()> {
        let (start, end) = (self.start, Instant::now());
        self.write_event("main", 0, start, end)?;
        writeln!(self.w, "\n]")?;
        self.w.flush()
    }
}

fn with_trace(f: impl FnOnce(&mut Trace) -> std::io::Result<()>) {
    let mut guard = TRACE.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(trace) = guard.as_mut() {
        if let Err(err) = f(trace) {
            tracing::warn!("trace: {}", err);
            *guard = None;
        }
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    *TRACE.lock().unwrap_or_else(|e| e.into_inner()) = Some(trace);
    Ok(())
}

fn enabled() -> bool {
    TRACE.lock().map(|t| t.is_some()).unwrap_or(false)
}

/// Record a span of work that happened on track `tid`, e.g. a build task.
pub fn write_complete(name: &str, tid: usize, start: Instant, end: Instant) {
    with_trace(|t| t.write_complete(name, tid, start, end));
}

#[inline]
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    if !enabled() {
        return f();
    }
    let start = Instant::now();
    let result = f();
    let end = Instant::now();
    write_complete(name, 0, start, end);
    result
}

pub fn close() -> std::io::Result<()> {
    let mut guard = TRACE.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(mut trace) = guard.take() {
        return trace.close();
    }
    Ok(())
}
