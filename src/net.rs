//! Blocking TCP listener for the control plane.
//!
//! One accept thread plus one thread per connection; every connection runs
//! [`ControlDispatcher::serve`] until the peer hangs up or the server shuts
//! down.

use crate::control::{ControlDispatcher, DispatchError};
use crate::timeouts::{READ_POLL_INTERVAL, SERVER_SHUTDOWN_GRACE};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("{context} did not stop within the shutdown grace period")]
    ShutdownTimeout { context: &'static str },
}

struct AcceptLoopState {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl AcceptLoopState {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn mark_stopped(&self) {
        *self.done.lock() = true;
        self.condvar.notify_all();
    }

    fn wait_for_stop(&self, timeout: Duration) -> Result<(), NetError> {
        let mut done = self.done.lock();
        if !*done {
            self.condvar.wait_for(&mut done, timeout);
        }
        if *done {
            Ok(())
        } else {
            Err(NetError::ShutdownTimeout {
                context: "control accept loop",
            })
        }
    }
}

#[derive(Default)]
struct ConnectionTracker {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ConnectionTracker {
    fn track(&self, handle: thread::JoinHandle<()>) {
        let mut handles = self.handles.lock();
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
    }

    fn join_all(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("event=control_connection_panic");
            }
        }
    }
}

/// Counts live connections; a permit releases its slot on drop.
struct ConnectionLimiter {
    active: AtomicUsize,
    limit: usize,
}

impl ConnectionLimiter {
    fn try_acquire(self: &Arc<Self>) -> Option<ConnectionPermit> {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            if current >= self.limit {
                return None;
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(ConnectionPermit {
                        limiter: Arc::clone(self),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }
}

struct ConnectionPermit {
    limiter: Arc<ConnectionLimiter>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.limiter.active.fetch_sub(1, Ordering::Release);
    }
}

/// Reader that rides out socket read timeouts until shutdown is requested,
/// then reports `ConnectionAborted`.
struct ShutdownReader {
    inner: TcpStream,
    shutdown: Arc<AtomicBool>,
}

impl Read for ShutdownReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "control server shutting down",
                ));
            }
            match self.inner.read(buf) {
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue
                }
                other => return other,
            }
        }
    }
}

pub struct ControlServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
    connections: Arc<ConnectionTracker>,
    state: Arc<AcceptLoopState>,
}

impl ControlServer {
    /// Binds `bind` and starts accepting control connections.
    pub fn spawn(dispatcher: Arc<ControlDispatcher>, bind: &str) -> Result<Self, NetError> {
        let listener = TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(ConnectionTracker::default());
        let state = Arc::new(AcceptLoopState::new());
        let limiter = Arc::new(ConnectionLimiter {
            active: AtomicUsize::new(0),
            limit: dispatcher.config().max_connections,
        });

        let accept_shutdown = Arc::clone(&shutdown);
        let accept_connections = Arc::clone(&connections);
        let accept_state = Arc::clone(&state);
        let join = thread::Builder::new()
            .name("control-accept".into())
            .spawn(move || {
                loop {
                    if accept_shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            let Some(permit) = limiter.try_acquire() else {
                                warn!(
                                    "event=control_connection_rejected addr={addr} reason=too_many_connections limit={}",
                                    limiter.limit
                                );
                                continue;
                            };
                            let dispatcher = Arc::clone(&dispatcher);
                            let shutdown = Arc::clone(&accept_shutdown);
                            let spawned = thread::Builder::new()
                                .name(format!("control-conn-{addr}"))
                                .spawn(move || {
                                    let _permit = permit;
                                    if let Err(err) = serve_connection(&dispatcher, stream, shutdown) {
                                        warn!("event=control_connection_error addr={addr} error={err}");
                                    }
                                });
                            match spawned {
                                Ok(handle) => accept_connections.track(handle),
                                Err(err) => {
                                    error!("event=control_connection_spawn_failed addr={addr} error={err}")
                                }
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_BACKOFF);
                        }
                        Err(err) => {
                            error!("event=control_accept_error error={err}");
                            break;
                        }
                    }
                }
                accept_state.mark_stopped();
            })?;
        info!("event=control_server_listening addr={local_addr}");
        Ok(Self {
            local_addr,
            shutdown,
            join: Some(join),
            connections,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, aborts live connections and joins every thread.
    pub fn shutdown(&mut self) -> Result<(), NetError> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take() {
            self.state.wait_for_stop(SERVER_SHUTDOWN_GRACE)?;
            if handle.join().is_err() {
                warn!("event=control_accept_loop_panic");
            }
            self.connections.join_all();
            info!("event=control_server_stopped addr={}", self.local_addr);
        }
        Ok(())
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("event=control_server_shutdown_failed error={err}");
        }
    }
}

fn serve_connection(
    dispatcher: &ControlDispatcher,
    stream: TcpStream,
    shutdown: Arc<AtomicBool>,
) -> Result<(), NetError> {
    let peer = stream.peer_addr()?;
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_POLL_INTERVAL))?;
    stream.set_write_timeout(Some(dispatcher.config().write_timeout()))?;
    let mut reader = ShutdownReader {
        inner: stream.try_clone()?,
        shutdown,
    };
    let mut writer = stream;
    debug!("event=control_connection_opened addr={peer}");
    let summary = dispatcher.serve(&mut reader, &mut writer)?;
    debug!(
        "event=control_connection_closed addr={peer} handled={} discarded={}",
        summary.handled, summary.discarded
    );
    Ok(())
}
