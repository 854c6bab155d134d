pub mod request;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zeromq::{
    PullSocket, ReqSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqError, ZmqMessage,
    ZmqResult,
};

/// Replies buffered between a socket task and its channel.
const REPLY_BUFFER: usize = 16;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by channel endpoints.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid channel address {address:?}: {reason}")]
    InvalidAddress {
        address: String,
        reason: &'static str,
    },

    #[error("{mode} channels cannot be used for {role}")]
    UnsupportedMode { mode: SocketMode, role: &'static str },

    #[error("opening {address}: {source}")]
    Open {
        address: String,
        #[source]
        source: BoxError,
    },

    #[error("sending on {address}: {source}")]
    Send {
        address: String,
        #[source]
        source: BoxError,
    },

    #[error("receiving on {address}: {source}")]
    Recv {
        address: String,
        #[source]
        source: BoxError,
    },

    #[error("channel {address} is not open")]
    Closed { address: String },

    #[error("channel {address} terminated")]
    Terminated { address: String },
}

impl TransportError {
    /// Terminated channels cannot be recovered by reopening.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidAddress { .. } => "invalid_address",
            Self::UnsupportedMode { .. } => "unsupported_mode",
            Self::Open { .. } => "open",
            Self::Send { .. } => "send",
            Self::Recv { .. } => "recv",
            Self::Closed { .. } => "closed",
            Self::Terminated { .. } => "terminated",
        }
    }
}

/// Messaging pattern of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    Req,
    Sub,
    Pull,
}

impl SocketMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Req => "REQ",
            Self::Sub => "SUB",
            Self::Pull => "PULL",
        }
    }

    /// Whether this mode expects a request before each reply.
    pub fn sends_requests(&self) -> bool {
        matches!(self, Self::Req)
    }

    fn binds_by_default(&self) -> bool {
        matches!(self, Self::Pull)
    }
}

impl fmt::Display for SocketMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `MODE>[@|+]transport://host:port` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAddress {
    pub mode: SocketMode,
    pub endpoint: String,
    pub bind: bool,
}

impl FromStr for ChannelAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| TransportError::InvalidAddress {
            address: s.to_string(),
            reason,
        };

        let (mode, rest) = s.trim().split_once('>').ok_or_else(|| invalid("missing MODE>"))?;
        let mode = match mode.trim().to_ascii_uppercase().as_str() {
            "REQ" => SocketMode::Req,
            "SUB" => SocketMode::Sub,
            "PULL" => SocketMode::Pull,
            _ => return Err(invalid("mode must be REQ, SUB or PULL")),
        };

        let (bind, endpoint) = if let Some(e) = rest.strip_prefix('@') {
            (true, e)
        } else if let Some(e) = rest.strip_prefix('+') {
            (false, e)
        } else {
            (mode.binds_by_default(), rest)
        };

        let (transport, host) = endpoint
            .split_once("://")
            .ok_or_else(|| invalid("missing transport://"))?;
        if !matches!(transport, "tcp" | "ipc") {
            return Err(invalid("transport must be tcp or ipc"));
        }
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            mode,
            endpoint: endpoint.to_string(),
            bind,
        })
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match (self.bind, self.mode.binds_by_default()) {
            (true, false) => "@",
            (false, true) => "+",
            _ => "",
        };
        write!(f, "{}>{}{}", self.mode, marker, self.endpoint)
    }
}

/// Operator command received on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Flush,
    Reset,
    Unknown(String),
}

impl ControlCommand {
    /// Reads the command from the first frame of a control message.
    pub fn from_frames(frames: &[Bytes]) -> Self {
        let text = frames
            .first()
            .map(|f| String::from_utf8_lossy(f).trim().to_ascii_lowercase())
            .unwrap_or_default();

        match text.as_str() {
            "flush" => Self::Flush,
            "reset" => Self::Reset,
            _ => Self::Unknown(text),
        }
    }
}

/// Result of waiting on the inbound and control channels.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Data(Vec<Bytes>),
    Control(ControlCommand),
    TimedOut,
    Cancelled,
}

/// A message-oriented endpoint.
pub trait Channel: Send {
    fn address(&self) -> &ChannelAddress;

    /// Creates the socket and connects or binds it.
    fn open(&mut self) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Drops the socket. No-op when already closed.
    fn close(&mut self) -> impl std::future::Future<Output = ()> + Send;

    fn send(
        &mut self,
        frames: Vec<Bytes>,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receives one multi-part message. Must be cancel-safe.
    fn recv(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Vec<Bytes>, TransportError>> + Send;
}

/// Result of an open attempt that can be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    Cancelled,
}

/// Opens `channel`, giving up when `cancel` fires or `limit` elapses.
///
/// Connecting to an absent peer retries until it appears, so without a
/// limit this only returns once the peer is up or on cancellation.
pub async fn open_within<C: Channel>(
    channel: &mut C,
    limit: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<OpenOutcome, TransportError> {
    let address = channel.address().to_string();
    let expired = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(OpenOutcome::Cancelled),
        opened = channel.open() => opened.map(|()| OpenOutcome::Opened),
        _ = expired => Err(TransportError::Open {
            address,
            source: format!("not connected within {limit:?}").into(),
        }),
    }
}

/// Closes and reopens `channel`, bounded by `limit`.
pub async fn reopen<C: Channel>(
    channel: &mut C,
    limit: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<OpenOutcome, TransportError> {
    channel.close().await;
    open_within(channel, limit, cancel).await
}

/// Waits for a message on `inbound` or `control` until `deadline`.
///
/// `deadline = None` waits forever. Cancellation wins over everything else.
pub async fn wait_readable<C: Channel, K: Channel>(
    inbound: &mut C,
    control: Option<&mut K>,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<WaitOutcome, TransportError> {
    let timeout = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    let control_recv = async {
        match control {
            Some(channel) => channel.recv().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(WaitOutcome::Cancelled),
        frames = inbound.recv() => frames.map(WaitOutcome::Data),
        frames = control_recv => {
            frames.map(|f| WaitOutcome::Control(ControlCommand::from_frames(&f)))
        }
        _ = timeout => Ok(WaitOutcome::TimedOut),
    }
}

type Outgoing = (ZmqMessage, oneshot::Sender<ZmqResult<()>>);

/// Handle on the task that owns an open socket.
///
/// The task keeps a receive in flight across `recv` calls, so dropping a
/// `recv` future never loses a message or a REQ socket's pending reply.
struct Link {
    /// Requests to send; only REQ sockets have one.
    outgoing: Option<mpsc::Sender<Outgoing>>,
    incoming: mpsc::Receiver<ZmqResult<ZmqMessage>>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// ZeroMQ-backed channel.
pub struct ZmqChannel {
    address: ChannelAddress,
    link: Option<Link>,
}

impl ZmqChannel {
    pub fn new(address: ChannelAddress) -> Self {
        Self {
            address,
            link: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn open_error(&self, source: ZmqError) -> TransportError {
        TransportError::Open {
            address: self.address.to_string(),
            source: Box::new(source),
        }
    }

    fn closed(&self) -> TransportError {
        TransportError::Closed {
            address: self.address.to_string(),
        }
    }
}

async fn attach<S: Socket>(socket: &mut S, address: &ChannelAddress) -> ZmqResult<()> {
    if address.bind {
        socket.bind(&address.endpoint).await.map(|_| ())
    } else {
        socket.connect(&address.endpoint).await
    }
}

/// Alternates send and receive on a REQ socket.
async fn drive_req(
    mut socket: ReqSocket,
    mut outgoing: mpsc::Receiver<Outgoing>,
    incoming: mpsc::Sender<ZmqResult<ZmqMessage>>,
    stop: CancellationToken,
    address: String,
) {
    loop {
        let (message, sent) = tokio::select! {
            _ = stop.cancelled() => break,
            next = outgoing.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = stop.cancelled() => break,
            result = socket.send(message) => result,
        };
        let failed = result.is_err();
        let _ = sent.send(result);
        if failed {
            continue;
        }

        let reply = tokio::select! {
            _ = stop.cancelled() => break,
            reply = socket.recv() => reply,
        };
        if incoming.send(reply).await.is_err() {
            break;
        }
    }

    shut(socket, &address).await;
}

/// Forwards everything a SUB or PULL socket receives.
///
/// Stops after the first receive error. The channel then stays silent
/// until it is reopened.
async fn drive_reader<S>(
    mut socket: S,
    incoming: mpsc::Sender<ZmqResult<ZmqMessage>>,
    stop: CancellationToken,
    address: String,
) where
    S: Socket + SocketRecv + Send + 'static,
{
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = socket.recv() => next,
        };
        let failed = next.is_err();
        if incoming.send(next).await.is_err() || failed {
            break;
        }
    }

    shut(socket, &address).await;
}

async fn shut<S: Socket>(socket: S, address: &str) {
    for e in socket.close().await {
        debug!(address, error = %e, "error while closing channel");
    }
}

impl Channel for ZmqChannel {
    fn address(&self) -> &ChannelAddress {
        &self.address
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        self.close().await;

        let address = self.address.to_string();
        let stop = CancellationToken::new();
        let (incoming_tx, incoming) = mpsc::channel(REPLY_BUFFER);

        let (outgoing, task) = match self.address.mode {
            SocketMode::Req => {
                let mut s = ReqSocket::new();
                attach(&mut s, &self.address)
                    .await
                    .map_err(|e| self.open_error(e))?;
                let (tx, rx) = mpsc::channel(1);
                let task = tokio::spawn(drive_req(s, rx, incoming_tx, stop.clone(), address));
                (Some(tx), task)
            }
            SocketMode::Sub => {
                let mut s = SubSocket::new();
                attach(&mut s, &self.address)
                    .await
                    .map_err(|e| self.open_error(e))?;
                s.subscribe("").await.map_err(|e| self.open_error(e))?;
                let task = tokio::spawn(drive_reader(s, incoming_tx, stop.clone(), address));
                (None, task)
            }
            SocketMode::Pull => {
                let mut s = PullSocket::new();
                attach(&mut s, &self.address)
                    .await
                    .map_err(|e| self.open_error(e))?;
                let task = tokio::spawn(drive_reader(s, incoming_tx, stop.clone(), address));
                (None, task)
            }
        };

        debug!(address = %self.address, "channel opened");
        self.link = Some(Link {
            outgoing,
            incoming,
            stop,
            task,
        });
        Ok(())
    }

    async fn close(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };

        let Link {
            outgoing,
            incoming,
            stop,
            task,
        } = link;
        drop(outgoing);
        drop(incoming);
        stop.cancel();
        if let Err(e) = task.await {
            debug!(address = %self.address, error = %e, "socket task ended abnormally");
        }
        debug!(address = %self.address, "channel closed");
    }

    async fn send(&mut self, frames: Vec<Bytes>) -> Result<(), TransportError> {
        let outgoing = match &self.link {
            Some(Link {
                outgoing: Some(tx), ..
            }) => tx.clone(),
            Some(_) => {
                return Err(TransportError::UnsupportedMode {
                    mode: self.address.mode,
                    role: "sending",
                })
            }
            None => return Err(self.closed()),
        };

        let mut parts = frames.into_iter();
        let mut message = ZmqMessage::from(parts.next().unwrap_or_default());
        for part in parts {
            message.push_back(part);
        }

        let (sent_tx, sent) = oneshot::channel();
        outgoing
            .send((message, sent_tx))
            .await
            .map_err(|_| self.closed())?;

        match sent.await {
            Ok(result) => result.map_err(|e| TransportError::Send {
                address: self.address.to_string(),
                source: Box::new(e),
            }),
            Err(_) => Err(self.closed()),
        }
    }

    async fn recv(&mut self) -> Result<Vec<Bytes>, TransportError> {
        let address = self.address.to_string();
        let Some(link) = self.link.as_mut() else {
            return Err(TransportError::Closed { address });
        };

        match link.incoming.recv().await {
            Some(Ok(message)) => Ok(message.into_vec()),
            Some(Err(e)) => Err(TransportError::Recv {
                address,
                source: Box::new(e),
            }),
            // Socket task is gone; nothing arrives until the channel is reopened.
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ChannelAddress {
        s.parse().expect("valid address")
    }

    #[test]
    fn test_parse_req_address() {
        let addr = parse("REQ>tcp://localhost:60201");
        assert_eq!(addr.mode, SocketMode::Req);
        assert_eq!(addr.endpoint, "tcp://localhost:60201");
        assert!(!addr.bind);
        assert_eq!(addr.to_string(), "REQ>tcp://localhost:60201");
    }

    #[test]
    fn test_parse_bind_and_connect_markers() {
        let sub = parse("SUB>@tcp://*:5555");
        assert!(sub.bind);
        assert_eq!(sub.endpoint, "tcp://*:5555");
        assert_eq!(sub.to_string(), "SUB>@tcp://*:5555");

        let pull = parse("pull>tcp://*:60299");
        assert_eq!(pull.mode, SocketMode::Pull);
        assert!(pull.bind);

        let pull = parse("PULL>+tcp://host:60299");
        assert!(!pull.bind);
        assert_eq!(pull.to_string(), "PULL>+tcp://host:60299");
    }

    #[test]
    fn test_parse_invalid_addresses() {
        for bad in [
            "tcp://localhost:1",
            "DEALER>tcp://localhost:1",
            "REQ>localhost:1",
            "REQ>udp://localhost:1",
            "REQ>tcp://",
        ] {
            let err = bad.parse::<ChannelAddress>().unwrap_err();
            assert!(
                matches!(err, TransportError::InvalidAddress { .. }),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn test_control_command_parsing() {
        let frames = |s: &str| vec![Bytes::copy_from_slice(s.as_bytes())];
        assert_eq!(ControlCommand::from_frames(&frames("flush")), ControlCommand::Flush);
        assert_eq!(ControlCommand::from_frames(&frames(" RESET\n")), ControlCommand::Reset);
        assert_eq!(
            ControlCommand::from_frames(&frames("stop")),
            ControlCommand::Unknown("stop".into())
        );
        assert_eq!(
            ControlCommand::from_frames(&[]),
            ControlCommand::Unknown(String::new())
        );
    }

    #[test]
    fn test_error_fatality() {
        assert!(TransportError::Terminated {
            address: "x".into()
        }
        .is_fatal());
        assert!(!TransportError::Closed {
            address: "x".into()
        }
        .is_fatal());
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_io() {
        let mut channel = ZmqChannel::new(parse("REQ>tcp://127.0.0.1:1"));
        assert!(!channel.is_open());
        assert!(matches!(
            channel.recv().await,
            Err(TransportError::Closed { .. })
        ));
        assert!(matches!(
            channel.send(vec![Bytes::new()]).await,
            Err(TransportError::Closed { .. })
        ));
        // Closing a closed channel is a no-op.
        channel.close().await;
    }

    #[tokio::test]
    async fn test_wait_readable_cancelled_before_deadline() {
        let mut channel = ZmqChannel::new(parse("PULL>tcp://127.0.0.1:0"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = wait_readable(&mut channel, None::<&mut ZmqChannel>, None, &cancel)
            .await
            .expect("cancel is not an error");

        assert_eq!(outcome, WaitOutcome::Cancelled);
    }
}
