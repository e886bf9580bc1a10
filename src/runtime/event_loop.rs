//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then
//! the connection machine performs non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Each worker polls with a short timeout so it can sweep its
//! connection table for expired deadlines even when no socket fires.

use crate::config::Config;
use crate::conn::{Conn, Disposition};
use crate::host::Host;
use crate::runtime::transport::TcpTransport;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Run the engine with the default host built from `config`.
pub fn run(config: Config) -> io::Result<()> {
    let host = Arc::new(Host::new(&config));
    run_with_host(config, host)
}

/// Run the engine with a caller-assembled host (embedder handlers and
/// filters already registered). Blocks until all workers exit.
pub fn run_with_host(config: Config, host: Arc<Host>) -> io::Result<()> {
    let num_workers = config.workers.unwrap_or_else(num_cpus);

    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    info!(
        workers = num_workers,
        addr = %addr,
        root = %config.root.display(),
        "Starting runtime"
    );

    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let config = config.clone();
        let host = Arc::clone(&host);

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                if let Err(e) = worker_loop(worker_id, addr, &config, host) {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })?;

        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

fn worker_loop(
    worker_id: usize,
    addr: SocketAddr,
    config: &Config,
    host: Arc<Host>,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENT_CAPACITY);

    // Listener with SO_REUSEPORT for kernel load balancing
    let listener = create_listener_with_reuseport(addr)?;
    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let max_connections = config.max_connections;
    let mut connections: Slab<Conn<TcpTransport>> = Slab::with_capacity(max_connections);

    info!(worker = worker_id, max_connections, "Worker started");

    loop {
        poll.poll(&mut events, Some(SWEEP_INTERVAL))?;
        let now = Instant::now();

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(
                        &listener,
                        &mut poll,
                        &mut connections,
                        &host,
                        max_connections,
                        worker_id,
                        now,
                    )?;
                }
                Token(conn_id) => {
                    if !connections.contains(conn_id) {
                        continue;
                    }
                    let conn = &mut connections[conn_id];
                    match conn.ready(event.is_readable(), event.is_writable(), now) {
                        Disposition::Continue { readable, writable } => {
                            let interest = match (readable, writable) {
                                (true, true) => Interest::READABLE.add(Interest::WRITABLE),
                                (false, true) => Interest::WRITABLE,
                                _ => Interest::READABLE,
                            };
                            let stream = conn.transport_mut().stream_mut();
                            if let Err(e) =
                                poll.registry().reregister(stream, Token(conn_id), interest)
                            {
                                debug!(conn_id, error = %e, "Reregister failed");
                                close_connection(&mut poll, &mut connections, conn_id);
                            }
                        }
                        Disposition::Close => {
                            close_connection(&mut poll, &mut connections, conn_id);
                        }
                    }
                }
            }
        }

        sweep_expired(&mut poll, &mut connections, now);
    }
}

fn accept_connections(
    listener: &TcpListener,
    poll: &mut Poll,
    connections: &mut Slab<Conn<TcpTransport>>,
    host: &Arc<Host>,
    max_connections: usize,
    worker_id: usize,
    now: Instant,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if connections.len() >= max_connections {
                    warn!("Connection limit reached");
                    continue;
                }

                let transport = TcpTransport::new(stream);
                let conn_id = connections.insert(Conn::new(transport, Arc::clone(host), now));

                // Re-borrow after insert
                let conn = &mut connections[conn_id];
                poll.registry().register(
                    conn.transport_mut().stream_mut(),
                    Token(conn_id),
                    Interest::READABLE,
                )?;

                debug!(
                    worker = worker_id,
                    conn_id,
                    peer = %peer_addr,
                    "Accepted connection"
                );
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
    Ok(())
}

/// Close connections whose deadline has passed.
fn sweep_expired(poll: &mut Poll, connections: &mut Slab<Conn<TcpTransport>>, now: Instant) {
    let expired: Vec<usize> = connections
        .iter()
        .filter(|(_, conn)| conn.expired(now))
        .map(|(id, _)| id)
        .collect();
    for conn_id in expired {
        debug!(conn_id, "Connection expired");
        close_connection(poll, connections, conn_id);
    }
}

fn close_connection(
    poll: &mut Poll,
    connections: &mut Slab<Conn<TcpTransport>>,
    conn_id: usize,
) {
    if let Some(mut conn) = connections.try_remove(conn_id) {
        conn.drain();
        let _ = poll.registry().deregister(conn.transport_mut().stream_mut());
        debug!(conn_id, "Connection closed");
    }
}

fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
