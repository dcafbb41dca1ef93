//! Tokio current-thread backend.
//!
//! One task multiplexes the pacer interval and the socket read with
//! `tokio::select!`, so tick and read handlers never interleave.

use crate::clock::Clock;
use crate::error::ProbeError;
use crate::runtime::connection::Link;
use crate::runtime::session::{RunStats, Session, TickAction};
use std::io::Write;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

const READ_CHUNK: usize = 16 * 1024;

/// Connect to `addr` and run the probe on a current-thread runtime.
pub fn run<C: Clock, O: Write, D: Write>(
    addr: SocketAddr,
    session: &mut Session<C, O, D>,
) -> Result<RunStats, ProbeError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            error!(addr = %addr, error = %e, "Connect error");
            ProbeError::Connect(e)
        })?;
        stream.set_nodelay(true)?;
        let local_port = stream.local_addr()?.port();

        info!(
            addr = %addr,
            local_port,
            initial_delay_ms = session.pacer().initial_delay().as_millis() as u64,
            period_ms = session.pacer().period().as_millis() as u64,
            "Starting tokio runtime"
        );
        drive(stream, local_port, session).await
    })
}

/// Run the probe over an established stream until the budget is spent.
pub async fn drive<S, C, O, D>(
    stream: S,
    local_port: u16,
    session: &mut Session<C, O, D>,
) -> Result<RunStats, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: Clock,
    O: Write,
    D: Write,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut link = Link::new();
    link.establish(local_port);
    session.on_connected(local_port);

    let pacer = session.pacer();
    let mut ticker = time::interval_at(Instant::now() + pacer.initial_delay(), pacer.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match session.tick(link.is_live()) {
                    TickAction::Send(frame) => {
                        if let Err(e) = writer.write_all(&frame).await {
                            session.on_write_failure(&e);
                        }
                    }
                    TickAction::Stop => {
                        if link.close() {
                            let _ = writer.shutdown().await;
                            debug!("Connection closed");
                        }
                        break;
                    }
                    TickAction::Skip | TickAction::Done => {}
                }
            }
            read = reader.read(&mut chunk), if link.is_live() => {
                match read {
                    Ok(0) => {
                        debug!("Stream ended by peer");
                        link.close();
                    }
                    Ok(n) => {
                        session.on_bytes(&chunk[..n])?;
                    }
                    Err(e) => {
                        error!(error = %e, "Read error");
                        link.close();
                    }
                }
            }
        }
    }

    session.finish()
}
