//! Control API: newline-delimited JSON requests and replies over TCP.
//!
//! Each request is one line, e.g.
//!
//! ```text
//! {"method": "startBuild", "params": {"targets": ["all"], "numThreads": 4}}
//! {"method": "getDirtySources"}
//! ```
//!
//! and is answered by one line, either `{"ok": <value>}` or
//! `{"error": {"kind": "TargetNotFound", "message": "..."}}`.

use crate::daemon::Daemon;
use crate::error::Error;
use crate::serve::Server;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Request {
    StartBuild {
        #[serde(default)]
        targets: Vec<String>,
        #[serde(default, rename = "numThreads", skip_serializing_if = "Option::is_none")]
        num_threads: Option<usize>,
    },
    InterruptBuild,
    Shutdown,
    GetPid,
    GetStatus,
    SetDirty {
        target: String,
    },
    GetDirtySources,
    GetDirtyTargets,
    GetInputsOf {
        target: String,
    },
    GetOutputsOf {
        target: String,
    },
    GetHashOf {
        target: String,
    },
    GetGraphviz,
}

/// An error reported by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl From<&Error> for RemoteError {
    fn from(err: &Error) -> Self {
        RemoteError {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Reply {
    Ok(Value),
    Error(RemoteError),
}

fn reply_to(daemon: &Daemon, line: &str) -> Reply {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            return Reply::Error(RemoteError {
                kind: "BadRequest".into(),
                message: err.to_string(),
            })
        }
    };
    tracing::debug!("rpc: {:?}", request);
    match daemon.handle(request) {
        Ok(value) => Reply::Ok(value),
        Err(err) => Reply::Error(RemoteError::from(&err)),
    }
}

fn handle_client(daemon: &Daemon, conn: TcpStream) -> anyhow::Result<()> {
    let mut writer = conn.try_clone()?;
    for line in BufReader::new(conn).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = reply_to(daemon, &line);
        let mut text = serde_json::to_vec(&reply)?;
        text.push(b'\n');
        writer.write_all(&text)?;
    }
    Ok(())
}

pub fn serve(listener: TcpListener, daemon: Daemon) -> std::io::Result<Server> {
    Server::spawn("rpc", listener, move |conn| handle_client(&daemon, conn))
}

/// Connection to a daemon's control API.
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    pub fn connect(addr: impl ToSocketAddrs) -> anyhow::Result<Client> {
        let writer = TcpStream::connect(addr)?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(Client { reader, writer })
    }

    /// Send a request and wait for its reply.  Errors the daemon reports
    /// come back as a RemoteError inside the anyhow::Error.
    pub fn call(&mut self, request: &Request) -> anyhow::Result<Value> {
        let mut text = serde_json::to_vec(request)?;
        text.push(b'\n');
        self.writer.write_all(&text)?;

        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            anyhow::bail!("daemon closed the connection");
        }
        match serde_json::from_str(&line)? {
            Reply::Ok(value) => Ok(value),
            Reply::Error(err) => Err(err.into()),
        }
    }
}
