//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when the socket is ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS. The pacer's next deadline doubles as the poll timeout, so timer
//! ticks and socket events are dispatched from the same single thread.

use crate::clock::Clock;
use crate::error::ProbeError;
use crate::runtime::connection::{ConnState, Link};
use crate::runtime::session::{RunStats, Session, TickAction};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Instant;
use tracing::{debug, error, info};

const CONN_TOKEN: Token = Token(0);

/// The probe connection for the mio backend.
///
/// Wraps the mio `TcpStream` together with the shared `Link` state and the
/// interest currently registered with the poller.
struct MioConnection {
    stream: TcpStream,
    link: Link,
    /// Whether WRITABLE is part of the registered interest.
    write_interest: bool,
}

/// Connect to `addr` and run the probe until the pacer's budget is spent.
pub fn run<C: Clock, O: Write, D: Write>(
    addr: SocketAddr,
    session: &mut Session<C, O, D>,
) -> Result<RunStats, ProbeError> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(64);

    let stream = connect(addr).map_err(|e| {
        error!(addr = %addr, error = %e, "Connect error");
        ProbeError::Connect(e)
    })?;
    let mut conn = MioConnection {
        stream,
        link: Link::new(),
        write_interest: true,
    };
    // WRITABLE reports completion of the non-blocking connect
    poll.registry().register(
        &mut conn.stream,
        CONN_TOKEN,
        Interest::READABLE | Interest::WRITABLE,
    )?;

    info!(
        addr = %addr,
        initial_delay_ms = session.pacer().initial_delay().as_millis() as u64,
        period_ms = session.pacer().period().as_millis() as u64,
        "Starting mio runtime"
    );
    session.pacer_mut().arm(Instant::now());

    while !session.is_finished() {
        let timeout = session
            .pacer()
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }

        for event in events.iter() {
            if event.token() != CONN_TOKEN || conn.link.is_closed() {
                continue;
            }

            if conn.link.state() == ConnState::Connecting {
                finish_connect(&mut poll, &mut conn, session)?;
                if !conn.link.is_live() {
                    continue;
                }
            }

            if event.is_readable() || event.is_read_closed() || event.is_error() {
                handle_readable(&mut poll, &mut conn, session)?;
            }

            if event.is_writable() && conn.link.is_live() {
                handle_writable(&mut poll, &mut conn, session)?;
            }
        }

        while session.pacer_mut().poll_due(Instant::now()) {
            handle_tick(&mut poll, &mut conn, session)?;
        }
    }

    close_connection(&mut poll, &mut conn);
    session.finish()
}

/// Create a non-blocking socket with Nagle disabled and start connecting.
fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let stream: std::net::TcpStream = socket.into();
    Ok(TcpStream::from_std(stream))
}

/// Resolve an in-flight connect after the first readiness event.
///
/// A failed connect ends the run with `ProbeError::Connect`; there is no
/// retry.
fn finish_connect<C: Clock, O: Write, D: Write>(
    poll: &mut Poll,
    conn: &mut MioConnection,
    session: &mut Session<C, O, D>,
) -> Result<(), ProbeError> {
    let failure = match conn.stream.take_error() {
        Ok(Some(e)) | Err(e) => Some(e),
        Ok(None) => match conn.stream.peer_addr() {
            Ok(_) => None,
            // Spurious wakeup, still connecting
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
            Err(e) => Some(e),
        },
    };

    if let Some(e) = failure {
        error!(error = %e, "Connect error");
        close_connection(poll, conn);
        return Err(ProbeError::Connect(e));
    }

    let local_port = conn.stream.local_addr()?.port();
    conn.link.establish(local_port);
    session.on_connected(local_port);
    info!(local_port, "Connected");

    update_interest(poll, conn)?;
    Ok(())
}

fn handle_readable<C: Clock, O: Write, D: Write>(
    poll: &mut Poll,
    conn: &mut MioConnection,
    session: &mut Session<C, O, D>,
) -> Result<(), ProbeError> {
    // Edge-triggered: drain until WouldBlock
    loop {
        match conn.stream.read(session.recv_buf()) {
            Ok(0) => {
                debug!("Stream ended by peer");
                close_connection(poll, conn);
                return Ok(());
            }
            Ok(n) => {
                session.on_read(n)?;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Read error");
                close_connection(poll, conn);
                return Ok(());
            }
        }
    }
}

fn handle_writable<C: Clock, O: Write, D: Write>(
    poll: &mut Poll,
    conn: &mut MioConnection,
    session: &mut Session<C, O, D>,
) -> Result<(), ProbeError> {
    while conn.link.has_outbound() {
        match conn.stream.write(conn.link.outbound()) {
            Ok(0) => {
                session.on_write_failure(&io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned 0",
                ));
                conn.link.discard_outbound();
            }
            Ok(n) => conn.link.consume(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                session.on_write_failure(&e);
                conn.link.discard_outbound();
            }
        }
    }

    update_interest(poll, conn)?;
    Ok(())
}

fn handle_tick<C: Clock, O: Write, D: Write>(
    poll: &mut Poll,
    conn: &mut MioConnection,
    session: &mut Session<C, O, D>,
) -> Result<(), ProbeError> {
    match session.tick(conn.link.is_live()) {
        TickAction::Send(frame) => {
            conn.link.enqueue(&frame);
            handle_writable(poll, conn, session)?;
        }
        TickAction::Stop => close_connection(poll, conn),
        TickAction::Skip | TickAction::Done => {}
    }
    Ok(())
}

/// Register WRITABLE only while bytes are queued.
fn update_interest(poll: &mut Poll, conn: &mut MioConnection) -> io::Result<()> {
    let want_write = conn.link.has_outbound();
    if want_write == conn.write_interest {
        return Ok(());
    }

    let interest = if want_write {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    poll.registry()
        .reregister(&mut conn.stream, CONN_TOKEN, interest)?;
    conn.write_interest = want_write;
    Ok(())
}

fn close_connection(poll: &mut Poll, conn: &mut MioConnection) {
    if conn.link.close() {
        let _ = poll.registry().deregister(&mut conn.stream);
        let _ = conn.stream.shutdown(Shutdown::Both);
        debug!("Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockSource;
    use crate::probe::{DesyncPolicy, Pacer, Reassembler, Reporter, FRAME_SIZE};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    type LoopbackSession = Session<ClockSource, Vec<u8>, Vec<u8>>;

    fn session(budget: u64, period_ms: u64) -> LoopbackSession {
        Session::new(
            Pacer::new(
                budget,
                Duration::from_millis(period_ms),
                Duration::from_millis(50),
            ),
            Reassembler::new(DesyncPolicy::Halt),
            Reporter::new(Vec::new(), Vec::new(), 500.0),
            ClockSource::Monotonic,
        )
    }

    /// Echo every byte back until the client closes.
    fn spawn_echo_server() -> (SocketAddr, thread::JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let mut total = 0;
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return total,
                    Ok(n) => {
                        total += n;
                        if stream.write_all(&buf[..n]).is_err() {
                            return total;
                        }
                    }
                }
            }
        });
        (addr, handle)
    }

    #[test]
    fn test_run_against_echo_server() {
        let (addr, server) = spawn_echo_server();
        let mut s = session(5, 50);

        let stats = run(addr, &mut s).unwrap();
        assert_eq!(stats.sent, 5);
        assert_eq!(stats.received, 5);
        assert_eq!(stats.desyncs, 0);

        let echoed = server.join().unwrap();
        assert_eq!(echoed, 5 * FRAME_SIZE);

        let (out, _) = s.into_reporter().into_parts();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 5);
        for line in lines {
            let ms: f64 = line.parse().unwrap();
            assert!(ms >= 0.0);
            assert_eq!(line.split('.').nth(1).map(str::len), Some(4));
        }
    }

    #[test]
    fn test_peer_close_ends_reading_but_not_the_run() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut frame = [0u8; FRAME_SIZE];
            stream.read_exact(&mut frame).unwrap();
            stream.write_all(&frame).unwrap();
        });

        let mut s = session(3, 30);
        let stats = run(addr, &mut s).unwrap();
        server.join().unwrap();

        assert_eq!(stats.sent, 1);
        assert_eq!(stats.received, 1);
        assert_eq!(s.pacer().ticks(), 4);
    }

    #[test]
    fn test_connect_failure() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let mut s = session(3, 10);
        let err = run(addr, &mut s).unwrap_err();
        assert!(matches!(err, ProbeError::Connect(_)));
        assert_eq!(s.stats().sent, 0);
        assert_eq!(s.pacer().ticks(), 0);

        let (out, diag) = s.into_reporter().into_parts();
        assert!(out.is_empty());
        assert!(diag.is_empty());
    }
}
