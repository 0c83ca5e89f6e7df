//! The single stream connection and the worker that owns it.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::{
    decode::{decode_query_ack, decode_response},
    frame::FrameReader,
    wire::{Command, QueryAck, WireResponse},
    ClientOptions, ConnectionState, DominoError, Result,
};

/// How long a torn-down connection may take to finish its in-flight command
/// and send its closing `CLOSE`s before the socket is shut down regardless.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// One established connection: a command writer and a frame reader.
pub(crate) struct Connection {
    writer: OwnedWriteHalf,
    frames: FrameReader<OwnedReadHalf>,
    command_timeout: Option<Duration>,
}

impl Connection {
    /// Opens a TCP connection. A failure is reported as the lifecycle state
    /// the attempt ended in.
    pub(crate) async fn open(
        host: &str,
        port: u16,
        options: &ClientOptions,
    ) -> std::result::Result<Self, ConnectionState> {
        let timeout = options.connect_timeout();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(connect_failure_state(&err)),
            Err(_) => {
                return Err(ConnectionState::Waiting(format!(
                    "connection to {host}:{port} timed out after {timeout:?}"
                )))
            }
        };
        // Commands are tiny; do not let Nagle hold them back.
        if let Err(err) = stream.set_nodelay(true) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %err, "failed to disable Nagle's algorithm");
            #[cfg(not(feature = "tracing"))]
            let _ = err;
        }

        let (reader, writer) = stream.into_split();
        Ok(Self {
            writer,
            frames: FrameReader::new(reader),
            command_timeout: options.command_timeout(),
        })
    }

    /// Writes one command and waits for exactly one response frame.
    ///
    /// Taking `&mut self` keeps a single command outstanding per connection.
    pub(crate) async fn send_command(&mut self, command: &Command) -> Result<String> {
        let line = command.encode();
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(DominoError::Transport)?;
        self.writer.flush().await.map_err(DominoError::Transport)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(command = line.trim_end(), "command sent");

        let frame = match self.command_timeout {
            Some(limit) => tokio::time::timeout(limit, self.frames.read_frame())
                .await
                .map_err(|_| DominoError::Timeout(limit))??,
            None => self.frames.read_frame().await?,
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(verb = command.verb(), bytes = frame.len(), "frame received");

        Ok(frame)
    }

    async fn shutdown(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

fn connect_failure_state(err: &std::io::Error) -> ConnectionState {
    match err.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::TimedOut | ErrorKind::AddrNotAvailable => {
            ConnectionState::Waiting(err.to_string())
        }
        _ => ConnectionState::Failed(err.to_string()),
    }
}

/// A command queued for the worker. Replies to requests without a ticket are
/// read and discarded.
struct Request<T> {
    command: Command,
    ticket: Option<T>,
}

/// What the worker reports back to the engine.
pub(crate) enum WorkerEvent<T> {
    Reply {
        ticket: T,
        outcome: Result<WireResponse>,
    },
    Lost { reason: String },
}

/// Engine-side handle of a running worker.
///
/// Dropping the handle tears the connection down: queued requests that carry
/// a ticket are discarded unsent, fire-and-forget `CLOSE`s still go out, and
/// the socket is shut down once they are answered or [`CLOSE_GRACE`] passes.
pub(crate) struct Worker<T> {
    // Never written; dropping it signals teardown. Declared first so the
    // worker observes teardown before the queue closes.
    _teardown: watch::Sender<()>,
    requests: mpsc::UnboundedSender<Request<T>>,
}

impl<T: Send + 'static> Worker<T> {
    pub(crate) fn spawn(
        connection: Connection,
        events: mpsc::UnboundedSender<WorkerEvent<T>>,
    ) -> Self {
        let (teardown, teardown_rx) = watch::channel(());
        let (requests, request_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(connection, request_rx, events, teardown_rx));
        Self {
            _teardown: teardown,
            requests,
        }
    }

    /// Queues a command. Returns false once the worker has stopped.
    pub(crate) fn send(&self, command: Command, ticket: Option<T>) -> bool {
        self.requests.send(Request { command, ticket }).is_ok()
    }
}

enum Served {
    Answered(Result<String>),
    /// Torn down mid-command; holds the reply if it arrived within the grace.
    TornDown(Option<Result<String>>),
}

fn torn_down(teardown: &watch::Receiver<()>) -> bool {
    teardown.has_changed().is_err()
}

/// Serves queued requests strictly one at a time until the stream fails or
/// the connection is torn down.
///
/// After a fatal error every still-queued ticket is answered with
/// [`DominoError::NotConnected`] so no caller is left waiting.
async fn run_worker<T: Send + 'static>(
    mut connection: Connection,
    mut requests: mpsc::UnboundedReceiver<Request<T>>,
    events: mpsc::UnboundedSender<WorkerEvent<T>>,
    mut teardown: watch::Receiver<()>,
) {
    while let Some(request) = requests.recv().await {
        if torn_down(&teardown) {
            let closing = request
                .ticket
                .is_none()
                .then_some(request.command)
                .into_iter()
                .collect();
            close_out(connection, closing, requests).await;
            return;
        }

        let served = {
            let pending = connection.send_command(&request.command);
            tokio::pin!(pending);
            tokio::select! {
                biased;
                outcome = &mut pending => Served::Answered(outcome),
                _ = teardown.changed() => {
                    Served::TornDown(tokio::time::timeout(CLOSE_GRACE, &mut pending).await.ok())
                }
            }
        };

        let outcome = match served {
            Served::Answered(outcome) => outcome,
            // The reply never came; the stream can no longer be paired.
            Served::TornDown(None) => {
                connection.shutdown().await;
                return;
            }
            Served::TornDown(Some(Err(err))) if err.is_fatal() => {
                connection.shutdown().await;
                return;
            }
            Served::TornDown(Some(outcome)) => {
                let closing = match (&request.command, outcome) {
                    (Command::Query(_), Ok(frame)) => decode_query_ack(&frame)
                        .ok()
                        .and_then(QueryAck::into_open_session)
                        .map(Command::Close)
                        .into_iter()
                        .collect(),
                    _ => Vec::new(),
                };
                close_out(connection, closing, requests).await;
                return;
            }
        };

        let lost = match &outcome {
            Err(err) if err.is_fatal() => Some(err.to_string()),
            _ => None,
        };

        if let Some(ticket) = request.ticket {
            let outcome = outcome.and_then(|frame| decode_response(&request.command, &frame));
            let _ = events.send(WorkerEvent::Reply { ticket, outcome });
        }

        if let Some(reason) = lost {
            #[cfg(feature = "tracing")]
            tracing::warn!(%reason, "connection lost");

            let _ = events.send(WorkerEvent::Lost { reason });
            requests.close();
            while let Some(pending) = requests.recv().await {
                if let Some(ticket) = pending.ticket {
                    let _ = events.send(WorkerEvent::Reply {
                        ticket,
                        outcome: Err(DominoError::NotConnected),
                    });
                }
            }
            return;
        }
    }

    connection.shutdown().await;
}

/// Sends `closing` plus every fire-and-forget request still queued, drops
/// queued requests that expect a reply, then shuts the socket down.
async fn close_out<T>(
    mut connection: Connection,
    mut closing: Vec<Command>,
    mut requests: mpsc::UnboundedReceiver<Request<T>>,
) {
    requests.close();
    while let Some(request) = requests.recv().await {
        if request.ticket.is_none() {
            closing.push(request.command);
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(closing = closing.len(), "tearing down connection");

    let sent = async {
        for command in &closing {
            if connection.send_command(command).await.is_err() {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(CLOSE_GRACE, sent).await;
    connection.shutdown().await;
}
