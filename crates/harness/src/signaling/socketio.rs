//! Socket.IO client over WebSocket (Engine.IO v4 framing)
//!
//! Only the subset the relay uses: namespace connect, named events, ping/pong
//! and close. Each text frame is one Engine.IO packet; type `4` packets carry
//! a Socket.IO packet whose event payload is a JSON array `[name, args...]`.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace, warn};
use url::Url;

use super::{SignalingEvent, SignalingLink};

/// Frame sent to join the default namespace
pub const CONNECT_FRAME: &str = "40";

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("empty frame")]
    Empty,

    #[error("unknown packet type {0:?}")]
    UnknownType(char),

    #[error("bad event payload: {0}")]
    BadEvent(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine.IO packet
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(String),
    Close,
    Ping(String),
    Pong(String),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

/// Socket.IO packet carried in an Engine.IO message
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, args: Vec<Value> },
    ConnectError(Option<Value>),
    Ack,
}

impl Packet {
    pub fn decode(frame: &str) -> Result<Self, PacketError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let rest = chars.as_str();
        Ok(match kind {
            '0' => Packet::Open(rest.to_string()),
            '1' => Packet::Close,
            '2' => Packet::Ping(rest.to_string()),
            '3' => Packet::Pong(rest.to_string()),
            '4' => Packet::Message(SocketPacket::decode(rest)?),
            '5' => Packet::Upgrade,
            '6' => Packet::Noop,
            other => return Err(PacketError::UnknownType(other)),
        })
    }

    /// Translate into the event the session consumes, if any
    pub fn into_event(self) -> Option<SignalingEvent> {
        match self {
            Packet::Close => Some(SignalingEvent::Disconnected),
            Packet::Message(SocketPacket::Connect(_)) => Some(SignalingEvent::Connect),
            Packet::Message(SocketPacket::Disconnect) => Some(SignalingEvent::Disconnected),
            Packet::Message(SocketPacket::ConnectError(data)) => Some(SignalingEvent::ConnectFailed(
                data.map(|d| describe(&d)).unwrap_or_else(|| "connect_error".to_string()),
            )),
            Packet::Message(SocketPacket::Event { name, args }) => event_from(&name, args),
            _ => None,
        }
    }
}

impl SocketPacket {
    fn decode(body: &str) -> Result<Self, PacketError> {
        let mut chars = body.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let payload = strip_namespace_and_ack(chars.as_str());
        let data = if payload.is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(payload)?)
        };

        Ok(match kind {
            '0' => SocketPacket::Connect(data),
            '1' => SocketPacket::Disconnect,
            '2' => match data {
                Some(Value::Array(mut items)) if !items.is_empty() => {
                    let name = match items.remove(0) {
                        Value::String(name) => name,
                        other => return Err(PacketError::BadEvent(other.to_string())),
                    };
                    SocketPacket::Event { name, args: items }
                }
                other => {
                    return Err(PacketError::BadEvent(
                        other.map(|v| v.to_string()).unwrap_or_default(),
                    ))
                }
            },
            '3' => SocketPacket::Ack,
            '4' => SocketPacket::ConnectError(data),
            other => return Err(PacketError::UnknownType(other)),
        })
    }
}

/// `/nsp,` prefix and numeric ack id both precede the JSON payload
fn strip_namespace_and_ack(rest: &str) -> &str {
    let rest = match rest.strip_prefix('/') {
        Some(ns) => ns.split_once(',').map(|(_, tail)| tail).unwrap_or(""),
        None => rest,
    };
    rest.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn event_from(name: &str, mut args: Vec<Value>) -> Option<SignalingEvent> {
    let first = if args.is_empty() { Value::Null } else { args.remove(0) };
    match name {
        "message" => Some(SignalingEvent::Message(match first {
            Value::String(raw) => raw,
            other => other.to_string(),
        })),
        "numclients" => match first.get("clients").and_then(Value::as_u64) {
            Some(n) => Some(SignalingEvent::NumClients(u32::try_from(n).unwrap_or(u32::MAX))),
            None => {
                warn!("numclients without a client count: {}", first);
                None
            }
        },
        "client_joined" => Some(SignalingEvent::ClientJoined),
        "error" => Some(SignalingEvent::Error(describe(&first))),
        other => {
            trace!("Ignoring relay event {}", other);
            None
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

/// `42["name", args...]`
pub fn encode_event(name: &str, args: &[Value]) -> String {
    let mut items = Vec::with_capacity(args.len() + 1);
    items.push(Value::String(name.to_string()));
    items.extend_from_slice(args);
    format!("42{}", Value::Array(items))
}

/// Relay WebSocket endpoint for a `<server>?room=<room>` channel URL
pub fn websocket_url(channel: &Url) -> Result<Url, url::ParseError> {
    let mut url = channel.clone();
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    // Only fails for cannot-be-a-base URLs, which `join` below rejects anyway.
    let _ = url.set_scheme(scheme);
    let mut url = url.join("socket.io/")?;
    url.set_query(channel.query());
    url.query_pairs_mut()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket");
    Ok(url)
}

/// Open the relay link; events arrive on the returned receiver
pub fn open(url: Url) -> SignalingLink {
    let (event_tx, events) = mpsc::unbounded_channel();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_client(url, event_tx, outbound_rx));
    SignalingLink { events, outbound }
}

async fn run_client(
    url: Url,
    events: mpsc::UnboundedSender<SignalingEvent>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    debug!("Opening relay socket {}", url);
    let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            let _ = events.send(SignalingEvent::ConnectFailed(e.to_string()));
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let reply = match Packet::decode(&text) {
                        Ok(Packet::Open(handshake)) => {
                            trace!("Engine.IO open: {}", handshake);
                            Some(CONNECT_FRAME.to_string())
                        }
                        Ok(Packet::Ping(data)) => Some(format!("3{}", data)),
                        Ok(packet) => {
                            if let Some(event) = packet.into_event() {
                                if events.send(event).is_err() {
                                    break;
                                }
                            }
                            None
                        }
                        Err(e) => {
                            warn!("Dropping undecodable relay frame {:?}: {}", text, e);
                            None
                        }
                    };
                    if let Some(reply) = reply {
                        if let Err(e) = sink.send(WsMessage::Text(reply)).await {
                            let _ = events.send(SignalingEvent::Error(e.to_string()));
                            let _ = events.send(SignalingEvent::Disconnected);
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    let _ = events.send(SignalingEvent::Disconnected);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(SignalingEvent::Error(e.to_string()));
                    let _ = events.send(SignalingEvent::Disconnected);
                    break;
                }
            },
            out = outbound.recv() => match out {
                Some(json) => {
                    let frame = encode_event("message", &[Value::String(json)]);
                    if let Err(e) = sink.send(WsMessage::Text(frame)).await {
                        let _ = events.send(SignalingEvent::Error(e.to_string()));
                        let _ = events.send(SignalingEvent::Disconnected);
                        break;
                    }
                }
                None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
        }
    }
    debug!("Relay socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_decode_message_event_with_string_payload() {
        let packet = Packet::decode(r#"42["message","{\"action\":\"test_loaded\",\"test\":\"x.html\"}"]"#).unwrap();
        assert_eq!(
            packet.into_event(),
            Some(SignalingEvent::Message(r#"{"action":"test_loaded","test":"x.html"}"#.to_string()))
        );
    }

    #[test]
    fn test_decode_numclients() {
        let packet = Packet::decode(r#"42["numclients",{"clients":2}]"#).unwrap();
        assert_eq!(packet.into_event(), Some(SignalingEvent::NumClients(2)));
    }

    #[test]
    fn test_namespace_and_ack_id_are_skipped() {
        let packet = Packet::decode(r#"42/relay,17["client_joined"]"#).unwrap();
        assert_eq!(
            packet,
            Packet::Message(SocketPacket::Event {
                name: "client_joined".into(),
                args: vec![]
            })
        );
    }

    #[test_case("40" => Some(SignalingEvent::Connect) ; "namespace connect")]
    #[test_case(r#"40{"sid":"abc"}"# => Some(SignalingEvent::Connect) ; "connect with sid")]
    #[test_case(r#"44{"message":"room full"}"# => Some(SignalingEvent::ConnectFailed("room full".into())) ; "connect error")]
    #[test_case("41" => Some(SignalingEvent::Disconnected) ; "namespace disconnect")]
    #[test_case("1" => Some(SignalingEvent::Disconnected) ; "engine close")]
    #[test_case("6" => None ; "noop")]
    #[test_case(r#"42["unrelated",1]"# => None ; "unknown event")]
    fn test_packet_to_event(frame: &str) -> Option<SignalingEvent> {
        Packet::decode(frame).unwrap().into_event()
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(Packet::decode(""), Err(PacketError::Empty)));
        assert!(matches!(Packet::decode("9"), Err(PacketError::UnknownType('9'))));
        assert!(matches!(Packet::decode("42{}"), Err(PacketError::BadEvent(_))));
        assert!(matches!(Packet::decode("42[oops"), Err(PacketError::Json(_))));
    }

    #[test]
    fn test_encode_message_event() {
        let frame = encode_event("message", &[json!("{\"action\":\"x\"}")]);
        assert_eq!(frame, r#"42["message","{\"action\":\"x\"}"]"#);
        assert_eq!(
            Packet::decode(&frame).unwrap().into_event(),
            Some(SignalingEvent::Message("{\"action\":\"x\"}".into()))
        );
    }

    #[test_case("http://relay:8080/?room=r1" => "ws://relay:8080/socket.io/?room=r1&EIO=4&transport=websocket")]
    #[test_case("https://relay.example/sig/?room=a%20b" => "wss://relay.example/sig/socket.io/?room=a%20b&EIO=4&transport=websocket")]
    fn test_websocket_url(channel: &str) -> String {
        websocket_url(&Url::parse(channel).unwrap()).unwrap().to_string()
    }
}
