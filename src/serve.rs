//! Accept loop shared by the RPC and progress stream servers: a listener
//! thread that hands every connection to its own thread.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct Server {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Serve `listener` until stopped, calling `handle` on a new thread per
    /// connection.
    pub fn spawn<F>(name: &'static str, listener: TcpListener, handle: F) -> std::io::Result<Server>
    where
        F: Fn(TcpStream) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let handle = Arc::new(handle);
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn({
                let stop = stop.clone();
                move || {
                    for stream in listener.incoming() {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        let stream = match stream {
                            Ok(stream) => stream,
                            Err(err) => {
                                tracing::warn!("{}: accept: {}", name, err);
                                continue;
                            }
                        };
                        let handle = handle.clone();
                        std::thread::spawn(move || {
                            if let Err(err) = handle(stream) {
                                tracing::debug!("{}: {}", name, err);
                            }
                        });
                    }
                }
            })?;
        tracing::info!("{} listening on {}", name, addr);
        Ok(Server {
            addr,
            stop,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections.  Connections already being served finish
    /// on their own.
    pub fn stop(&mut self) {
        let thread = match self.thread.take() {
            Some(thread) => thread,
            None => return,
        };
        self.stop.store(true, Ordering::SeqCst);
        // Wake the accept() call so the loop sees the flag.
        let _ = TcpStream::connect(self.addr);
        let _ = thread.join();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
