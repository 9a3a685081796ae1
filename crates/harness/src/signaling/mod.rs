//! Signaling session
//!
//! Connects to the external relay, joins the room, and waits until exactly
//! two participants (this party and its counterpart) are present. Once the
//! room is ready every application message from the relay is fed to the
//! [`Mailbox`].

pub mod socketio;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use steeplechase_common::{Error, Message, Result, SignalingRoomState};

use crate::mailbox::Mailbox;

/// Outgoing half of the signaling channel
pub trait Channel: Send + Sync {
    /// Fire-and-forget send; no acknowledgment is awaited
    fn send(&self, msg: &Message) -> Result<()>;
}

/// Event surfaced by the relay transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Connect,
    Error(String),
    ConnectFailed(String),
    /// Raw JSON-encoded application message
    Message(String),
    NumClients(u32),
    ClientJoined,
    Disconnected,
}

/// Transport-level link to the relay
pub struct SignalingLink {
    pub events: mpsc::UnboundedReceiver<SignalingEvent>,
    /// JSON-encoded messages to relay to the counterpart
    pub outbound: mpsc::UnboundedSender<String>,
}

/// Something that can bring up a ready two-party channel
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, mailbox: Arc<Mailbox>) -> Result<Arc<dyn Channel>>;
}

/// An established two-party session on the relay
pub struct SignalingSession {
    state: Arc<Mutex<SignalingRoomState>>,
    outbound: mpsc::UnboundedSender<String>,
    pump: JoinHandle<()>,
}

impl SignalingSession {
    /// Run the connect and room-membership handshake over `link`.
    ///
    /// Transport errors reject the handshake only until the connection is
    /// up; after that they are logged and ignored. The member count is
    /// consulted once: 2 means the counterpart is already here, more than 2
    /// is a capacity error, and fewer means waiting for one join notice.
    pub async fn establish(link: SignalingLink, mailbox: Arc<Mailbox>) -> Result<Self> {
        let SignalingLink { mut events, outbound } = link;
        let state = Arc::new(Mutex::new(SignalingRoomState::Connecting));

        let result = Self::handshake(&mut events, &mailbox, &state).await;
        if let Err(e) = result {
            transition(&state, SignalingRoomState::Failed);
            return Err(e);
        }

        transition(&state, SignalingRoomState::Ready);
        info!("Signaling room ready, counterpart present");
        let pump = tokio::spawn(pump_messages(events, mailbox));

        Ok(Self {
            state,
            outbound,
            pump,
        })
    }

    async fn handshake(
        events: &mut mpsc::UnboundedReceiver<SignalingEvent>,
        mailbox: &Mailbox,
        state: &Mutex<SignalingRoomState>,
    ) -> Result<()> {
        loop {
            match events.recv().await {
                Some(SignalingEvent::Connect) => break,
                Some(SignalingEvent::Error(reason)) => {
                    return Err(Error::Connect(format!("socket.io error: {}", reason)))
                }
                Some(SignalingEvent::ConnectFailed(reason)) => {
                    return Err(Error::Connect(format!("socket failed to connect: {}", reason)))
                }
                Some(SignalingEvent::Disconnected) | None => {
                    return Err(Error::Connect("relay closed before connect".into()))
                }
                Some(other) => trace!("Ignoring {:?} before connect", other),
            }
        }
        transition(state, SignalingRoomState::Connected);

        let mut awaiting_join = false;
        loop {
            match events.recv().await {
                Some(SignalingEvent::Message(raw)) => deliver_raw(mailbox, &raw),
                Some(SignalingEvent::NumClients(clients)) if !awaiting_join => {
                    debug!("Room has {} client(s)", clients);
                    match clients {
                        2 => return Ok(()),
                        n if n > 2 => return Err(Error::RoomOverCapacity { clients: n }),
                        _ => {
                            awaiting_join = true;
                            transition(state, SignalingRoomState::AwaitingPeer);
                        }
                    }
                }
                Some(SignalingEvent::ClientJoined) if awaiting_join => return Ok(()),
                Some(SignalingEvent::Error(reason)) | Some(SignalingEvent::ConnectFailed(reason)) => {
                    warn!("Relay error after connect: {}", reason)
                }
                Some(SignalingEvent::Disconnected) | None => {
                    return Err(Error::ChannelClosed("relay closed while joining room".into()))
                }
                Some(other) => trace!("Ignoring {:?} while joining room", other),
            }
        }
    }

    pub fn state(&self) -> SignalingRoomState {
        *self.state.lock()
    }
}

impl Channel for SignalingSession {
    fn send(&self, msg: &Message) -> Result<()> {
        let json = msg.to_json()?;
        trace!("Relaying {}", json);
        self.outbound
            .send(json)
            .map_err(|_| Error::ChannelClosed("relay link is gone".into()))
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn transition(state: &Mutex<SignalingRoomState>, next: SignalingRoomState) {
    let mut current = state.lock();
    debug!("Signaling {} -> {}", *current, next);
    *current = next;
}

fn deliver_raw(mailbox: &Mailbox, raw: &str) {
    match Message::from_json(raw) {
        Ok(msg) => mailbox.deliver(msg),
        Err(e) => {
            warn!("Undecodable relay message {}: {}", raw, e);
            mailbox.deliver_error(Error::Serialization(e));
        }
    }
}

async fn pump_messages(mut events: mpsc::UnboundedReceiver<SignalingEvent>, mailbox: Arc<Mailbox>) {
    while let Some(event) = events.recv().await {
        match event {
            SignalingEvent::Message(raw) => deliver_raw(&mailbox, &raw),
            SignalingEvent::Disconnected => break,
            SignalingEvent::Error(reason) => warn!("Relay error: {}", reason),
            other => trace!("Ignoring {:?}", other),
        }
    }
    warn!("Signaling relay disconnected");
    mailbox.deliver_error(Error::ChannelClosed("signaling relay disconnected".into()));
}

/// `addr` with a guaranteed trailing `/`
pub fn normalize_server(addr: &str) -> String {
    if addr.ends_with('/') {
        addr.to_string()
    } else {
        format!("{}/", addr)
    }
}

/// Where the relay serves its client library
pub fn client_library_url(server: &str) -> String {
    format!("{}socket.io/socket.io.js", normalize_server(server))
}

/// `<server>?room=<room>`
pub fn channel_url(server: &str, room: &str) -> Result<Url> {
    let mut url = Url::parse(&normalize_server(server))
        .map_err(|e| Error::Connect(format!("bad signaling server {}: {}", server, e)))?;
    url.query_pairs_mut().append_pair("room", room);
    Ok(url)
}

/// Connector for a Socket.IO relay
pub struct SocketIoConnector {
    server: String,
    room: String,
    http: reqwest::Client,
}

impl SocketIoConnector {
    pub fn new(server: &str, room: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Load(e.to_string()))?;
        Ok(Self {
            server: normalize_server(server),
            room: room.to_string(),
            http,
        })
    }

    /// The relay must serve its client library before we try to connect
    async fn probe_client_library(&self) -> Result<()> {
        let url = client_library_url(&self.server);
        debug!("Loading signaling client library from {}", url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Load(format!("{}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(Error::Load(format!("{} returned {}", url, resp.status())));
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingConnector for SocketIoConnector {
    async fn connect(&self, mailbox: Arc<Mailbox>) -> Result<Arc<dyn Channel>> {
        self.probe_client_library().await?;

        let channel = channel_url(&self.server, &self.room)?;
        let ws_url = socketio::websocket_url(&channel)
            .map_err(|e| Error::Connect(format!("bad relay URL {}: {}", channel, e)))?;
        info!("Connecting to signaling room {} via {}", self.room, self.server);

        let session = SignalingSession::establish(socketio::open(ws_url), mailbox).await?;
        Ok(Arc::new(session))
    }
}
