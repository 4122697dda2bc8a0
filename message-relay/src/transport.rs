//! TCP side of a broker connection.
//!
//! Each accepted socket is split into a reader task and a writer task. The
//! writer drains a queue of outbound [`Frame`]s. The reader turns inbound
//! `request` frames into [`InboundRequest`]s for the connection's lifecycle
//! task and routes `response` frames back to whichever [`PeerChannel::send`]
//! is waiting on them.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{
        Mutex,
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::{JoinError, JoinHandle},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    channel::{Channel, InboundRequest, SendOutcome},
    message::{Frame, FrameError, Message, ResponseStatus, SERVICE_NAME, read_frame, write_frame},
};

const OUTBOUND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 64;

/// Requests one side of a connection has sent and is still waiting on.
#[derive(Default)]
pub(crate) struct PendingRequests {
    closed: bool,
    next_id: u64,
    waiting: HashMap<u64, oneshot::Sender<ResponseStatus>>,
}

impl PendingRequests {
    fn register(&mut self) -> Option<(u64, oneshot::Receiver<ResponseStatus>)> {
        if self.closed {
            return None;
        }
        self.next_id += 1;
        let (status_tx, status_rx) = oneshot::channel();
        self.waiting.insert(self.next_id, status_tx);
        Some((self.next_id, status_rx))
    }

    pub(crate) fn resolve(&mut self, id: u64, status: ResponseStatus) {
        match self.waiting.remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(status);
            }
            None => debug!(id, "response for unknown or expired request"),
        }
    }

    /// Drops every waiter; later registrations fail immediately.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.waiting.clear();
    }
}

pub(crate) type SharedPending = Arc<Mutex<PendingRequests>>;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RequestError {
    Closed,
    TimedOut,
    /// The message would not fit in a frame; nothing was sent.
    TooLarge,
}

/// Sends `message` as a request frame and waits for the matching response.
pub(crate) async fn request(
    outbound: &mpsc::Sender<Frame>,
    pending: &SharedPending,
    message: &Message,
    wait: Duration,
) -> Result<ResponseStatus, RequestError> {
    if !message.fits_in_frame() {
        return Err(RequestError::TooLarge);
    }
    let Some((id, status_rx)) = pending.lock().await.register() else {
        return Err(RequestError::Closed);
    };

    let frame = Frame::Request {
        id,
        message: message.clone(),
    };
    if outbound.send(frame).await.is_err() {
        pending.lock().await.waiting.remove(&id);
        return Err(RequestError::Closed);
    }

    match timeout(wait, status_rx).await {
        Ok(Ok(status)) => Ok(status),
        // The reader dropped every waiter: the socket is gone.
        Ok(Err(_)) => Err(RequestError::Closed),
        Err(_) => {
            pending.lock().await.waiting.remove(&id);
            Err(RequestError::TimedOut)
        }
    }
}

/// Outbound half of a client connection as seen by the broker.
pub struct PeerChannel {
    outbound: mpsc::Sender<Frame>,
    pending: SharedPending,
    send_timeout: Duration,
}

impl Channel for PeerChannel {
    async fn send(&self, message: &Message) -> SendOutcome {
        match request(&self.outbound, &self.pending, message, self.send_timeout).await {
            Ok(status) => SendOutcome::from_status(status),
            Err(RequestError::Closed) => SendOutcome::DeliveryFailure,
            Err(RequestError::TimedOut) => SendOutcome::TransportError(format!(
                "no response within {}ms",
                self.send_timeout.as_millis()
            )),
            Err(RequestError::TooLarge) => {
                SendOutcome::UnknownStatus(ResponseStatus::MessageSizeTooLarge)
            }
        }
    }
}

/// Everything the lifecycle task needs from a freshly accepted connection.
pub struct Accepted {
    pub channel: PeerChannel,
    pub inbound: mpsc::Receiver<InboundRequest>,
    pub reader: ReaderTask,
    /// Opens the writer. Until it fires nothing reaches the client, not even
    /// the `accepted` frame, so a client never sends before it is registered.
    /// Dropping it closes the connection unanswered.
    pub ready: oneshot::Sender<()>,
}

/// The task reading frames from a client, plus the table of sends waiting on
/// that client's responses.
pub struct ReaderTask {
    handle: JoinHandle<()>,
    pending: SharedPending,
}

impl ReaderTask {
    /// Stops reading and fails every send still waiting on this client. A
    /// relay that upgraded the channel before the connection ended gets a
    /// delivery failure right away instead of waiting out its timeout.
    pub async fn stop(self) {
        self.handle.abort();
        self.pending.lock().await.close();
    }

    /// Waits for the client to close its side of the connection.
    pub async fn join(self) -> Result<(), JoinError> {
        self.handle.await
    }
}

/// Reads the client's `hello` and starts the reader and writer tasks, with
/// the `accepted` answer queued behind [`Accepted::ready`]. On failure the
/// client is told why (when the socket still allows it) and the error is
/// returned.
pub async fn accept(
    stream: TcpStream,
    handshake_timeout: Duration,
    send_timeout: Duration,
) -> Result<Accepted> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;

    let handshake = match timeout(handshake_timeout, perform_handshake(&mut reader)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("no hello within {handshake_timeout:?}")),
    };
    if let Err(err) = handshake {
        reject(&mut writer, &err.to_string()).await;
        return Err(err);
    }

    Ok(start(reader, writer, send_timeout))
}

async fn perform_handshake<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let hello = match read_frame::<_, Frame>(reader).await? {
        Some(frame) => frame,
        None => bail!("connection closed before handshake"),
    };

    match hello {
        Frame::Hello { service } if service == SERVICE_NAME => Ok(()),
        Frame::Hello { service } => bail!("unknown service '{service}'"),
        _ => bail!("expected hello frame first"),
    }
}

async fn reject<W>(writer: &mut W, reason: &str)
where
    W: AsyncWrite + Unpin,
{
    let frame = Frame::Rejected {
        reason: reason.to_string(),
    };
    if let Err(err) = write_frame(writer, &frame).await {
        debug!(?err, "failed to tell client about rejected handshake");
    }
    let _ = writer.shutdown().await;
}

fn start(
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    send_timeout: Duration,
) -> Accepted {
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let (ready_tx, ready_rx) = oneshot::channel();
    let pending = SharedPending::default();

    // The queue is empty, so this cannot fail; the writer holds it back until ready.
    let _ = outbound_tx.try_send(Frame::Accepted);
    tokio::spawn(async move {
        if ready_rx.await.is_ok() {
            run_writer(writer, outbound_rx).await;
        }
    });
    let handle = tokio::spawn(run_reader(
        reader,
        inbound_tx,
        outbound_tx.clone(),
        Arc::clone(&pending),
    ));
    let reader = ReaderTask {
        handle,
        pending: Arc::clone(&pending),
    };

    Accepted {
        channel: PeerChannel {
            outbound: outbound_tx,
            pending,
            send_timeout,
        },
        inbound: inbound_rx,
        reader,
        ready: ready_tx,
    }
}

/// Writes queued frames until every sender is gone, then closes the socket's
/// write half so the other side sees end of stream.
pub(crate) async fn run_writer(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Frame>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            debug!(?err, "failed to write frame");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_reader(
    mut reader: BufReader<OwnedReadHalf>,
    inbound: mpsc::Sender<InboundRequest>,
    outbound: mpsc::Sender<Frame>,
    pending: SharedPending,
) {
    loop {
        match read_frame::<_, Frame>(&mut reader).await {
            Ok(Some(Frame::Request { id, message })) => {
                if !forward_request(id, message, &inbound, &outbound) {
                    break;
                }
            }
            Ok(Some(Frame::Response { id, status })) => pending.lock().await.resolve(id, status),
            Ok(Some(other)) => warn!(frame = ?other, "ignoring unexpected frame"),
            Ok(None) => break,
            Err(err @ FrameError::TooLarge { .. }) => {
                warn!(%err, "closing connection to client that sent an oversized frame");
                break;
            }
            Err(err) => {
                debug!(?err, "client connection closed with error");
                break;
            }
        }
    }

    // Dropping the waiters turns every in-flight send into a delivery failure.
    pending.lock().await.close();
}

/// Hands a request to the lifecycle task and answers the client once the
/// request's deferral has been released. Never waits on the lifecycle, so the
/// reader keeps routing responses while a relay is in progress. Returns
/// `false` when the lifecycle task is gone.
fn forward_request(
    id: u64,
    message: Message,
    inbound: &mpsc::Sender<InboundRequest>,
    outbound: &mpsc::Sender<Frame>,
) -> bool {
    let (request, completion) = InboundRequest::new(message);
    let status = match inbound.try_send(request) {
        Ok(()) => None,
        Err(TrySendError::Full(_)) => Some(ResponseStatus::ResourceLimitsExceeded),
        Err(TrySendError::Closed(_)) => Some(ResponseStatus::Failure),
    };

    let lifecycle_gone = status == Some(ResponseStatus::Failure);
    let outbound = outbound.clone();
    tokio::spawn(async move {
        let status = match status {
            Some(status) => status,
            None => {
                completion.wait().await;
                ResponseStatus::Success
            }
        };
        let _ = outbound.send(Frame::Response { id, status }).await;
    });
    !lifecycle_gone
}
