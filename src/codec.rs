//! Text framing for the socket channel.
//!
//! Every websocket message is one engine frame: a single digit giving the
//! engine packet type, followed by its body. Message frames (`4`) carry a
//! socket packet, itself `<type>[/<namespace>,][<ack id>][<json>]`, so an
//! event on the extension namespace reads
//! `42/extension,["video_state",{...}]`.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("empty frame")]
    Empty,
    #[error("unknown {layer} packet type {found:?}")]
    UnknownType { layer: &'static str, found: char },
    #[error("binary packets are not supported")]
    Binary,
    #[error("frame is on namespace {found}, expected {expected}")]
    WrongNamespace { expected: String, found: String },
    #[error("ack id {0} does not fit in 64 bits")]
    AckIdOverflow(String),
    #[error("packet is not an event")]
    NotAnEvent,
    #[error("event payload must be a non-empty array starting with a name")]
    BadEventShape,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// One websocket text message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open(Value),
    Close,
    Ping,
    Pong,
    Message(Packet),
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
}

impl PacketKind {
    fn digit(self) -> char {
        match self {
            PacketKind::Connect => '0',
            PacketKind::Disconnect => '1',
            PacketKind::Event => '2',
            PacketKind::Ack => '3',
            PacketKind::ConnectError => '4',
        }
    }

    fn from_digit(c: char) -> Result<Self, ParseError> {
        match c {
            '0' => Ok(PacketKind::Connect),
            '1' => Ok(PacketKind::Disconnect),
            '2' => Ok(PacketKind::Event),
            '3' => Ok(PacketKind::Ack),
            '4' => Ok(PacketKind::ConnectError),
            '5' | '6' => Err(ParseError::Binary),
            found => Err(ParseError::UnknownType {
                layer: "socket",
                found,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    /// `/` for the default namespace, which is left out on the wire.
    pub namespace: String,
    pub ack_id: Option<u64>,
    pub data: Option<Value>,
}

impl Packet {
    pub fn connect(namespace: &str) -> Self {
        Self {
            kind: PacketKind::Connect,
            namespace: namespace.to_owned(),
            ack_id: None,
            data: None,
        }
    }

    pub fn event<T: Serialize>(namespace: &str, event: &str, payload: &T) -> Result<Self, ParseError> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self {
            kind: PacketKind::Event,
            namespace: namespace.to_owned(),
            ack_id: None,
            data: Some(Value::Array(vec![Value::String(event.to_owned()), payload])),
        })
    }

    pub fn ack<T: Serialize>(namespace: &str, ack_id: u64, payload: &T) -> Result<Self, ParseError> {
        Ok(Self {
            kind: PacketKind::Ack,
            namespace: namespace.to_owned(),
            ack_id: Some(ack_id),
            data: Some(Value::Array(vec![serde_json::to_value(payload)?])),
        })
    }

    /// Splits an event packet into its name and first argument.
    /// A missing argument reads as `null`.
    pub fn into_event(self) -> Result<(String, Value), ParseError> {
        if self.kind != PacketKind::Event {
            return Err(ParseError::NotAnEvent);
        }
        let Some(Value::Array(items)) = self.data else {
            return Err(ParseError::BadEventShape);
        };
        let mut items = items.into_iter();
        let name = match items.next() {
            Some(Value::String(name)) => name,
            _ => return Err(ParseError::BadEventShape),
        };
        Ok((name, items.next().unwrap_or(Value::Null)))
    }

    fn parse(body: &str) -> Result<Self, ParseError> {
        let mut chars = body.chars();
        let kind = PacketKind::from_digit(chars.next().ok_or(ParseError::Empty)?)?;
        let mut rest = chars.as_str();

        let mut namespace = "/".to_owned();
        if rest.starts_with('/') {
            match rest.find(',') {
                Some(idx) => {
                    namespace = rest[..idx].to_owned();
                    rest = &rest[idx + 1..];
                }
                None => {
                    namespace = rest.to_owned();
                    rest = "";
                }
            }
        }

        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        let ack_id = if digits > 0 {
            let id = &rest[..digits];
            let id = id
                .parse()
                .map_err(|_| ParseError::AckIdOverflow(id.to_owned()))?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let data = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        Ok(Self {
            kind,
            namespace,
            ack_id,
            data,
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.digit())?;
        if self.namespace != "/" {
            write!(f, "{},", self.namespace)?;
        }
        if let Some(id) = self.ack_id {
            write!(f, "{id}")?;
        }
        if let Some(data) = &self.data {
            write!(f, "{data}")?;
        }
        Ok(())
    }
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(ParseError::Empty)?;
        let body = chars.as_str();
        match kind {
            '0' => Ok(Frame::Open(if body.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(body)?
            })),
            '1' => Ok(Frame::Close),
            // ping and pong bodies are only used during transport upgrades, which we never do
            '2' => Ok(Frame::Ping),
            '3' => Ok(Frame::Pong),
            '4' => Ok(Frame::Message(Packet::parse(body)?)),
            '6' => Ok(Frame::Noop),
            'b' => Err(ParseError::Binary),
            found => Err(ParseError::UnknownType {
                layer: "engine",
                found,
            }),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Open(handshake) => write!(f, "0{handshake}"),
            Frame::Close => f.write_str("1"),
            Frame::Ping => f.write_str("2"),
            Frame::Pong => f.write_str("3"),
            Frame::Message(packet) => write!(f, "4{packet}"),
            Frame::Noop => f.write_str("6"),
        }
    }
}

impl From<Packet> for Frame {
    fn from(packet: Packet) -> Self {
        Frame::Message(packet)
    }
}

/// Event encoder/decoder bound to one namespace.
#[derive(Debug, Clone)]
pub struct EventCodec {
    namespace: String,
}

impl EventCodec {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The frame a client sends to join this namespace.
    pub fn join(&self) -> String {
        Frame::from(Packet::connect(&self.namespace)).to_string()
    }

    pub fn encode<T: Serialize>(&self, event: &str, payload: &T) -> Result<String, ParseError> {
        Ok(Frame::from(Packet::event(&self.namespace, event, payload)?).to_string())
    }

    pub fn decode(&self, frame: &str) -> Result<(String, Value), ParseError> {
        match Frame::parse(frame)? {
            Frame::Message(packet) => self.decode_packet(packet),
            _ => Err(ParseError::NotAnEvent),
        }
    }

    pub fn decode_packet(&self, packet: Packet) -> Result<(String, Value), ParseError> {
        if packet.namespace != self.namespace {
            return Err(ParseError::WrongNamespace {
                expected: self.namespace.clone(),
                found: packet.namespace,
            });
        }
        packet.into_event()
    }
}
