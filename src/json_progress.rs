//! Writes build progress as one JSON document, flushed piece by piece:
//!
//! ```text
//! {"id":3,"cmds":[{"id":0,"cmd":"...","stdout":"...","stderr":"..."},
//!   {"cache":"out"}],"result":"SUCCEEDED"}
//! ```
//!
//! Each element of `cmds` is complete and flushed before the next begins, so
//! a reader can act on it without waiting for the rest of the document.

use std::io::Write;

use crate::process::CommandOutput;
use crate::progress::Progress;
use serde_json::json;

/// Implements progress::Progress by streaming JSON to a writer.
pub struct JsonProgress<W: Write> {
    /// None after a write failure; a vanished reader must not fail the build.
    stream: Option<W>,
    cmds: usize,
    finished: bool,
}

impl<W: Write> JsonProgress<W> {
    pub fn new(build_id: u64, w: W) -> Self {
        let mut progress = JsonProgress {
            stream: Some(w),
            cmds: 0,
            finished: false,
        };
        progress.write_raw(format!("{{\"id\":{},\"cmds\":[", build_id).as_bytes());
        progress
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        if let Some(stream) = &mut self.stream {
            if stream.write_all(bytes).and_then(|_| stream.flush()).is_err() {
                self.stream = None;
            }
        }
    }

    fn write_cmd(&mut self, val: serde_json::Value) {
        let mut buf = Vec::new();
        if self.cmds > 0 {
            buf.push(b',');
        }
        // Serializing a Value into a Vec can't fail.
        let _ = serde_json::to_writer(&mut buf, &val);
        self.cmds += 1;
        self.write_raw(&buf);
    }

    /// Consume the progress, returning the writer if it's still healthy.
    pub fn into_inner(mut self) -> Option<W> {
        self.stream.take()
    }
}

impl<W: Write + Send> Progress for JsonProgress<W> {
    fn task_started(&mut self, _cmdline: &str) {
        // Commands are reported when they finish, with their output.
    }

    fn task_finished(&mut self, cmdline: &str, result: &CommandOutput) {
        let id = self.cmds;
        self.write_cmd(json!({
            "id": id,
            "cmd": cmdline,
            "stdout": String::from_utf8_lossy(&result.stdout),
            "stderr": String::from_utf8_lossy(&result.stderr),
        }));
    }

    fn cached(&mut self, target: &str) {
        self.write_cmd(json!({ "cache": target }));
    }

    fn log(&mut self, _msg: &str) {}

    fn finish(&mut self, success: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let result = if success { "SUCCEEDED" } else { "FAILED" };
        self.write_raw(format!("],\"result\":\"{}\"}}\n", result).as_bytes());
    }
}

impl<W: Write> Drop for JsonProgress<W> {
    fn drop(&mut self) {
        if !self.finished && self.stream.is_some() {
            self.finished = true;
            self.write_raw(b"],\"result\":\"FAILED\"}\n");
        }
    }
}
