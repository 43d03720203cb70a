//! TCP listener and per-connection lifecycle.
//!
//! One accepted connection owns one [`DebugSession`]. The connection thread
//! only reads, decodes and dispatches; it never blocks on VM state. Session
//! teardown on disconnect transitions the session to `Dead` and wakes any
//! parked VM thread, so a vanished client cannot wedge the VM.

use crate::debugger::hook::{ClientRegistry, HostHooks};
use crate::debugger::{DebugSession, DispatchOutcome};
use crate::proto::FrameDecoder;
use log::{info, warn};
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

pub const DEFAULT_PORT: u16 = 12345;

pub struct DebugServer {
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
}

impl DebugServer {
    pub fn bind(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!(target: "net", "debugger listening on {}", listener.local_addr()?);
        Ok(DebugServer {
            listener,
            registry: Arc::new(ClientRegistry::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    /// The adapter to install as the VM's break/error callbacks.
    pub fn hooks(&self) -> HostHooks {
        HostHooks::new(self.registry.clone())
    }

    /// Accept clients until the listener fails. Each connection gets its own
    /// thread; a failed accept is logged and retried.
    pub fn run(self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(target: "net", "accept failed: {err:#}");
                    continue;
                }
            };
            info!(target: "net", "debugger client connected: {peer}");
            if let Err(err) = self.start_client(stream) {
                warn!(target: "net", "failed to start client {peer}: {err:#}");
            }
        }
    }

    /// Spawn the accept loop on a background thread.
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("pawndbg-listener".to_string())
            .spawn(move || self.run())
            .expect("spawn listener thread")
    }

    fn start_client(&self, stream: TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        let write_half = stream.try_clone()?;
        let session = Arc::new(DebugSession::new(Box::new(write_half)));
        self.registry.add(session.clone());
        session.greet();

        let registry = self.registry.clone();
        thread::Builder::new()
            .name("pawndbg-client".to_string())
            .spawn(move || {
                serve_client(stream, &session, &registry);
            })?;
        Ok(())
    }
}

/// Read loop for one client. Returns on EOF, a read error, a malformed
/// frame or `StopDebugging`.
fn serve_client(mut stream: TcpStream, session: &Arc<DebugSession>, registry: &Arc<ClientRegistry>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    'read: loop {
        let read_n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(target: "net", "client read failed: {err:#}");
                break;
            }
        };
        decoder.extend(&buf[..read_n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => match session.dispatch(frame.tag, frame.payload) {
                    Ok(DispatchOutcome::Continue) => {}
                    Ok(DispatchOutcome::Shutdown) => break 'read,
                    Err(err) => {
                        warn!(target: "net", "dropping client: {err:#}");
                        break 'read;
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(target: "net", "dropping client: {err:#}");
                    break 'read;
                }
            }
        }
    }
    registry.remove(session);
    session.shutdown();
    info!(target: "net", "debugger client disconnected");
}
