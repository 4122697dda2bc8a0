use std::{fmt, net::SocketAddr, time::Duration};

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpStream, tcp::OwnedReadHalf},
    select,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    message::{Frame, Message, ResponseStatus, SERVICE_NAME, read_frame, write_frame},
    transport::{self, RequestError, SharedPending},
};

const OUTBOUND_QUEUE: usize = 64;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Relayed messages a client holds before [`RelayClient::recv`] picks them
/// up. Past this the client answers `resource_limits_exceeded` and the
/// message is lost for this client only.
pub const RELAYED_QUEUE: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("Error sending {0}")]
    Status(ResponseStatus),
    #[error("not connected to the message relay")]
    Disconnected,
    #[error("no answer from the message relay within {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// A client's connection to the message relay.
///
/// Messages sent with [`RelayClient::send_message`] reach every other
/// connected client. Messages relayed from other clients arrive through
/// [`RelayClient::recv`].
pub struct RelayClient {
    outbound: mpsc::Sender<Frame>,
    pending: SharedPending,
    inbound: mpsc::Receiver<Message>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl RelayClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        write_frame(
            &mut writer,
            &Frame::Hello {
                service: SERVICE_NAME.to_string(),
            },
        )
        .await?;

        match read_frame::<_, Frame>(&mut reader).await? {
            Some(Frame::Accepted) => {}
            Some(Frame::Rejected { reason }) => {
                bail!("message relay rejected the connection: {reason}")
            }
            Some(other) => bail!("unexpected handshake response: {other:?}"),
            None => bail!("message relay closed the connection during handshake"),
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(RELAYED_QUEUE);
        let pending = SharedPending::default();

        let writer = tokio::spawn(transport::run_writer(writer, outbound_rx));
        let reader = tokio::spawn(run_reader(
            reader,
            inbound_tx,
            outbound_tx.clone(),
            SharedPending::clone(&pending),
        ));

        Ok(Self {
            outbound: outbound_tx,
            pending,
            inbound: inbound_rx,
            reader,
            writer: Some(writer),
        })
    }

    /// Keeps trying to connect, sleeping `delay` between attempts. `attempts`
    /// bounds the number of tries; `None` retries forever.
    pub async fn connect_with_retry(
        addr: SocketAddr,
        delay: Duration,
        attempts: Option<usize>,
    ) -> Result<Self> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::connect(addr).await {
                Ok(client) => return Ok(client),
                Err(err) if attempts.is_some_and(|max| attempt >= max) => {
                    return Err(err.context(format!("gave up after {attempt} attempts")));
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        "unable to connect to message relay, retrying in {}s",
                        delay.as_secs()
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    pub async fn send_message(&self, key: &str, value: &str) -> Result<(), SendError> {
        self.send(&Message::single(key, value)).await
    }

    /// Hands `message` to the relay. Success means the relay accepted it, not
    /// that any other client received it.
    pub async fn send(&self, message: &Message) -> Result<(), SendError> {
        match transport::request(&self.outbound, &self.pending, message, REQUEST_TIMEOUT).await {
            Ok(ResponseStatus::Success) => Ok(()),
            Ok(status) => Err(SendError::Status(status)),
            Err(RequestError::Closed) => Err(SendError::Disconnected),
            Err(RequestError::TimedOut) => Err(SendError::TimedOut(REQUEST_TIMEOUT)),
            Err(RequestError::TooLarge) => Err(SendError::Status(ResponseStatus::MessageSizeTooLarge)),
        }
    }

    /// Next message relayed from another client; `None` once the relay has
    /// closed the connection.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished()
    }

    /// Closes the connection and waits until the relay has been told.
    pub async fn close(mut self) {
        let writer = self.writer.take();
        drop(self);
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        // The reader holds a sender into the writer queue; stopping it lets
        // the writer finish and close the socket.
        self.reader.abort();
    }
}

async fn run_reader(
    mut reader: BufReader<OwnedReadHalf>,
    inbound: mpsc::Sender<Message>,
    outbound: mpsc::Sender<Frame>,
    pending: SharedPending,
) {
    loop {
        match read_frame::<_, Frame>(&mut reader).await {
            Ok(Some(Frame::Request { id, message })) => {
                let status = match inbound.try_send(message) {
                    Ok(()) => ResponseStatus::Success,
                    Err(TrySendError::Full(_)) => {
                        warn!(id, "relayed message queue is full, turning message away");
                        ResponseStatus::ResourceLimitsExceeded
                    }
                    Err(TrySendError::Closed(_)) => ResponseStatus::Failure,
                };
                if outbound.send(Frame::Response { id, status }).await.is_err() {
                    break;
                }
            }
            Ok(Some(Frame::Response { id, status })) => pending.lock().await.resolve(id, status),
            Ok(Some(other)) => warn!(frame = ?other, "ignoring unexpected frame"),
            Ok(None) => break,
            Err(err) => {
                debug!(?err, "relay connection closed with error");
                break;
            }
        }
    }

    pending.lock().await.close();
}

/// Terminal client: every stdin line is sent under `args.key`, every relayed
/// message is printed.
pub async fn run(args: ClientArgs) -> Result<()> {
    let mut client = RelayClient::connect_with_retry(
        args.server,
        Duration::from_secs(args.retry_secs),
        None,
    )
    .await?;
    info!("connected to {}", args.server);
    print(Notice::Connected).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            message = client.recv() => match message {
                Some(message) => print(Notice::Relayed(&message)).await?,
                None => {
                    print(Notice::RelayClosed).await?;
                    break;
                }
            },
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 || !submit_line(&input, &client, &args.key).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    client.close().await;
    Ok(())
}

/// Sends one line of input. Returns `false` when the session should end.
async fn submit_line(input: &str, client: &RelayClient, key: &str) -> Result<bool> {
    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }
    if text.eq_ignore_ascii_case("/quit") {
        print(Notice::Leaving).await?;
        return Ok(false);
    }

    match client.send_message(key, text).await {
        Ok(()) => print(Notice::Sent).await?,
        Err(err) => {
            print(Notice::SendFailed(&err)).await?;
            return Ok(err != SendError::Disconnected);
        }
    }
    Ok(true)
}

/// One line of terminal output.
enum Notice<'a> {
    Connected,
    Relayed(&'a Message),
    Sent,
    SendFailed(&'a SendError),
    Leaving,
    RelayClosed,
}

impl fmt::Display for Notice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Connected => f.write_str("*** connected to message relay"),
            Notice::Relayed(message) => match message.first() {
                Some((_, value)) => write!(f, ">>> {value}"),
                None => f.write_str(">>> (empty message)"),
            },
            Notice::Sent => f.write_str("*** message sent"),
            Notice::SendFailed(err) => write!(f, "!!! send error: {err}"),
            Notice::Leaving => f.write_str("*** leaving"),
            Notice::RelayClosed => f.write_str("*** message relay closed the connection"),
        }
    }
}

/// Failures go to stderr, everything else to stdout.
async fn print(notice: Notice<'_>) -> io::Result<()> {
    let line = format!("{notice}\n");
    match notice {
        Notice::SendFailed(_) => emit(tokio::io::stderr(), &line).await,
        _ => emit(tokio::io::stdout(), &line).await,
    }
}

async fn emit<W>(mut out: W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}
