//! Progress stream: serves the JSON progress document of the current build
//! to any number of readers while it's being written.
//!
//! A reader that connects gets the most recently started build, from its
//! first byte, or waits for the next build if there hasn't been one.  The
//! connection closes once the document is complete.

use crate::serve::Server;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex};

/// One build's document, shared between its writer and its readers.
#[derive(Default)]
pub struct BuildStream {
    data: Mutex<StreamData>,
    cond: Condvar,
}

#[derive(Default)]
struct StreamData {
    bytes: Vec<u8>,
    closed: bool,
}

impl BuildStream {
    /// Copy the document to `w` as it's produced, returning when it's
    /// complete (or `w` fails).
    pub fn copy_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        let mut sent = 0;
        loop {
            let (chunk, closed) = {
                let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
                while data.bytes.len() == sent && !data.closed {
                    data = self.cond.wait(data).unwrap_or_else(|e| e.into_inner());
                }
                (data.bytes[sent..].to_vec(), data.closed)
            };
            sent += chunk.len();
            w.write_all(&chunk)?;
            w.flush()?;
            if closed && chunk.is_empty() {
                return Ok(());
            }
        }
    }

    /// The document written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).bytes.clone()
    }
}

/// Write half of a BuildStream; dropping it completes the document.
pub struct StreamWriter(Arc<BuildStream>);

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut data = self.0.data.lock().unwrap_or_else(|e| e.into_inner());
        data.bytes.extend_from_slice(buf);
        self.0.cond.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        let mut data = self.0.data.lock().unwrap_or_else(|e| e.into_inner());
        data.closed = true;
        self.0.cond.notify_all();
    }
}

/// Tracks the latest build's stream.
#[derive(Default)]
pub struct StreamHub {
    latest: Mutex<Option<Arc<BuildStream>>>,
    cond: Condvar,
}

impl StreamHub {
    pub fn new() -> Arc<StreamHub> {
        Arc::default()
    }

    /// Start the stream for a new build.  Readers of the previous build keep
    /// their copy; new readers get this one.
    pub fn begin(&self) -> StreamWriter {
        let stream = Arc::new(BuildStream::default());
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(stream.clone());
        self.cond.notify_all();
        StreamWriter(stream)
    }

    pub fn latest(&self) -> Option<Arc<BuildStream>> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The latest build's stream, waiting for one to begin if necessary.
    pub fn wait_latest(&self) -> Arc<BuildStream> {
        let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(stream) = latest.as_ref() {
                return stream.clone();
            }
            latest = self.cond.wait(latest).unwrap_or_else(|e| e.into_inner());
        }
    }
}

fn handle_client(hub: &StreamHub, mut conn: TcpStream) -> anyhow::Result<()> {
    let stream = hub.wait_latest();
    stream.copy_to(&mut conn)?;
    conn.shutdown(std::net::Shutdown::Both)?;
    Ok(())
}

pub fn serve(listener: TcpListener, hub: Arc<StreamHub>) -> std::io::Result<Server> {
    Server::spawn("stream", listener, move |conn| handle_client(&hub, conn))
}
