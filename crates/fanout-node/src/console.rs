use fanout_core::{BroadcastResult, BroadcastService, FrameSink, InboundFrame, PingService};
use fanout_transport::Overlay;
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Prints received frames in green on stdout.
pub struct ConsoleSink;

impl FrameSink for ConsoleSink {
    fn deliver(&self, frame: InboundFrame) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(
            lock,
            "\x1b[32m[{} {}] {}\x1b[0m",
            frame.peer.short(),
            frame.protocol,
            frame.text
        );
        let _ = lock.flush();
    }
}

/// What each stdin line turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Broadcast,
    Ping,
}

/// Feed stdin lines to the service until `shutdown` fires.
///
/// Lines are broadcast verbatim, terminator included, and handled one at
/// a time so successive broadcasts reach each peer in input order. A send
/// still running at shutdown gets up to `drain_timeout` to finish. End of
/// input does not stop the node.
pub async fn run<O: Overlay>(
    mode: Mode,
    service: BroadcastService<O>,
    ping: PingService<O>,
    shutdown: CancellationToken,
) {
    let mut stdin = BufReader::new(tokio::io::stdin());

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = next_line(&mut stdin) => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        };

        let work = handle_line(mode, &service, &ping, line);
        tokio::pin!(work);
        tokio::select! {
            _ = &mut work => {}
            _ = shutdown.cancelled() => {
                // Let the in-flight send finish before handles are closed
                let drain = service.config().drain_timeout;
                if tokio::time::timeout(drain, work).await.is_err() {
                    warn!(after = ?drain, "abandoned in-flight send at shutdown");
                }
                return;
            }
        }
    }

    shutdown.cancelled().await;
}

/// Next input line with its terminator, exactly as read.
async fn next_line<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

async fn handle_line<O: Overlay>(
    mode: Mode,
    service: &BroadcastService<O>,
    ping: &PingService<O>,
    line: Vec<u8>,
) {
    match mode {
        Mode::Broadcast => match service.broadcast_default(line).await {
            Ok(result) => report(&result),
            Err(e) => eprintln!("broadcast failed: {e}"),
        },
        Mode::Ping => {
            let text = String::from_utf8_lossy(&line);
            let msg = text.trim_end_matches(['\r', '\n']);
            if msg.is_empty() {
                return;
            }
            for (peer, e) in ping.ping_all(msg).await {
                eprintln!("ping {} failed: {e}", peer.short());
            }
        }
    }
}

fn report(result: &BroadcastResult) {
    for failure in &result.open_failures {
        eprintln!("open {} failed: {}", failure.peer.short(), failure.reason);
    }
    for delivery in result.failures() {
        eprintln!(
            "send to {} ({}) failed: {}",
            delivery.peer.short(),
            delivery.direction,
            delivery.outcome
        );
    }
    if result.deliveries.is_empty() {
        eprintln!("no peers connected");
    }
}
