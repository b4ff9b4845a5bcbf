//! The genome: an ordered sequence of protocol send/receive actions.
//!
//! Every message carries a statically declared list of modifiable
//! fields. A field is either *lazy* (its concrete value is computed by
//! the wire collaborator at execution time) or carries an explicit
//! override set by a mutation. Which fields a message type has, and in
//! which order they are enumerated, is fixed by the tables in
//! [`MessageType::field_descriptors`]; that declaration order is the
//! deterministic enumeration contract the systematic sweep relies on.

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    rands::{Rand, StdRand},
    Error,
};

/// Which side of the connection a message originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEnd {
    /// The fuzzing engine's side.
    Client,
    /// The target under test.
    Server,
}

/// The protocol message kinds the engine knows how to mutate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)] // handshake message names speak for themselves
pub enum MessageType {
    ClientHello,
    ServerHello,
    Certificate,
    ServerHelloDone,
    ClientKeyExchange,
    ChangeCipherSpec,
    Finished,
    Heartbeat,
    Alert,
    ApplicationData,
}

/// The shape of one modifiable field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    Bytes,
}

/// A concrete field value, overriding the lazy default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// A random value of the given shape.
    pub fn random(kind: FieldKind, rand: &mut StdRand) -> Self {
        match kind {
            FieldKind::U8 => FieldValue::U8(rand.next() as u8),
            FieldKind::U16 => FieldValue::U16(rand.next() as u16),
            FieldKind::U32 => FieldValue::U32(rand.next() as u32),
            FieldKind::Bytes => {
                let len = rand.between(1, 64) as usize;
                FieldValue::Bytes((0..len).map(|_| rand.next() as u8).collect())
            }
        }
    }
}

/// Static description of one modifiable field of a message type.
#[derive(Clone, Copy, Debug)]
pub struct FieldDescriptor {
    /// Field name, unique within its message type.
    pub name: &'static str,
    /// The field's value shape.
    pub kind: FieldKind,
}

const fn fd(name: &'static str, kind: FieldKind) -> FieldDescriptor {
    FieldDescriptor { name, kind }
}

impl MessageType {
    /// The modifiable fields of this message type, in the order the
    /// systematic sweep enumerates them.
    #[must_use]
    pub fn field_descriptors(self) -> &'static [FieldDescriptor] {
        use FieldKind::{Bytes, U16, U32, U8};

        const CLIENT_HELLO: &[FieldDescriptor] = &[
            fd("protocol_version", U16),
            fd("client_random", Bytes),
            fd("session_id", Bytes),
            fd("cipher_suites", Bytes),
            fd("compression_methods", Bytes),
            fd("extensions", Bytes),
        ];
        const SERVER_HELLO: &[FieldDescriptor] = &[
            fd("protocol_version", U16),
            fd("server_random", Bytes),
            fd("session_id", Bytes),
            fd("cipher_suite", U16),
            fd("compression_method", U8),
        ];
        const CERTIFICATE: &[FieldDescriptor] = &[
            fd("certificates_length", U32),
            fd("certificate_bytes", Bytes),
        ];
        const CLIENT_KEY_EXCHANGE: &[FieldDescriptor] =
            &[fd("public_key_length", U16), fd("public_key", Bytes)];
        const CHANGE_CIPHER_SPEC: &[FieldDescriptor] = &[fd("ccs_value", U8)];
        const FINISHED: &[FieldDescriptor] = &[fd("verify_data", Bytes)];
        const HEARTBEAT: &[FieldDescriptor] = &[
            fd("heartbeat_type", U8),
            fd("payload_length", U16),
            fd("payload", Bytes),
        ];
        const ALERT: &[FieldDescriptor] = &[fd("level", U8), fd("description", U8)];
        const APPLICATION_DATA: &[FieldDescriptor] = &[fd("data", Bytes)];

        match self {
            MessageType::ClientHello => CLIENT_HELLO,
            MessageType::ServerHello => SERVER_HELLO,
            MessageType::Certificate => CERTIFICATE,
            MessageType::ServerHelloDone => &[],
            MessageType::ClientKeyExchange => CLIENT_KEY_EXCHANGE,
            MessageType::ChangeCipherSpec => CHANGE_CIPHER_SPEC,
            MessageType::Finished => FINISHED,
            MessageType::Heartbeat => HEARTBEAT,
            MessageType::Alert => ALERT,
            MessageType::ApplicationData => APPLICATION_DATA,
        }
    }
}

/// One modifiable field instance inside a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// The descriptor name this field instantiates.
    pub name: String,
    /// `None` means the value is resolved lazily at execution time.
    pub explicit: Option<FieldValue>,
}

/// A raw record smuggled into the record layer next to a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record-layer content type byte.
    pub content_type: u8,
    /// Raw record payload.
    pub payload: Vec<u8>,
}

/// A typed protocol message with its modifiable fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The message kind.
    pub msg_type: MessageType,
    /// Which side sends this message.
    pub issuer: ConnectionEnd,
    /// Field instances, one per descriptor, in descriptor order.
    pub fields: Vec<Field>,
    /// Extra raw records to emit alongside this message.
    pub records: Vec<Record>,
}

impl Message {
    /// A message with all fields lazy and no extra records.
    #[must_use]
    pub fn new(msg_type: MessageType, issuer: ConnectionEnd) -> Self {
        let fields = msg_type
            .field_descriptors()
            .iter()
            .map(|desc| Field {
                name: desc.name.to_string(),
                explicit: None,
            })
            .collect();
        Self {
            msg_type,
            issuer,
            fields,
            records: Vec::new(),
        }
    }
}

/// One step of the workflow, from the engine's point of view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Messages the engine sends to the target.
    Send {
        /// The messages to serialize and send.
        messages: Vec<Message>,
    },
    /// Messages the engine expects (or observed) from the target.
    Receive {
        /// Expected messages when planned, observed messages in an
        /// observed trace.
        messages: Vec<Message>,
    },
}

impl Action {
    /// True for send actions.
    #[must_use]
    pub fn is_send(&self) -> bool {
        matches!(self, Action::Send { .. })
    }

    /// The messages of this action, regardless of direction.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        match self {
            Action::Send { messages } | Action::Receive { messages } => messages,
        }
    }

    /// Mutable access to the messages of this action.
    pub fn messages_mut(&mut self) -> &mut Vec<Message> {
        match self {
            Action::Send { messages } | Action::Receive { messages } => messages,
        }
    }
}

/// Addresses one modifiable field inside a trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPath {
    /// Action index within the trace.
    pub action: usize,
    /// Message index within the action.
    pub message: usize,
    /// Field index within the message (descriptor order).
    pub field: usize,
}

/// The genome: an ordered sequence of protocol actions.
///
/// A trace is created by cloning and mutating a parent, or by loading
/// it from disk. Once handed to an agent for execution it is never
/// mutated again; children are always grown from a fresh clone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    /// The ordered actions.
    pub actions: Vec<Action>,
    /// Free-text annotation, set when a rule persists this trace.
    pub description: Option<String>,
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl Trace {
    /// An empty trace.
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            description: None,
        }
    }

    /// The generation-zero workflow: a full TLS handshake driven from
    /// the client side.
    #[must_use]
    pub fn client_handshake() -> Self {
        use ConnectionEnd::{Client, Server};
        use MessageType::{
            Certificate, ChangeCipherSpec, ClientHello, ClientKeyExchange, Finished, ServerHello,
            ServerHelloDone,
        };
        Self {
            actions: vec![
                Action::Send {
                    messages: vec![Message::new(ClientHello, Client)],
                },
                Action::Receive {
                    messages: vec![
                        Message::new(ServerHello, Server),
                        Message::new(Certificate, Server),
                        Message::new(ServerHelloDone, Server),
                    ],
                },
                Action::Send {
                    messages: vec![
                        Message::new(ClientKeyExchange, Client),
                        Message::new(ChangeCipherSpec, Client),
                        Message::new(Finished, Client),
                    ],
                },
                Action::Receive {
                    messages: vec![
                        Message::new(ChangeCipherSpec, Server),
                        Message::new(Finished, Server),
                    ],
                },
            ],
            description: None,
        }
    }

    /// Total number of messages over all actions.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.actions.iter().map(|a| a.messages().len()).sum()
    }

    /// Number of messages in send actions.
    #[must_use]
    pub fn send_message_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.is_send())
            .map(|a| a.messages().len())
            .sum()
    }

    /// All received messages in trace order.
    pub fn received_messages(&self) -> impl Iterator<Item = &Message> {
        self.actions
            .iter()
            .filter(|a| !a.is_send())
            .flat_map(|a| a.messages().iter())
    }

    /// Position (in received-message order) of the first received
    /// message of the given type.
    #[must_use]
    pub fn first_received(&self, msg_type: MessageType) -> Option<usize> {
        self.received_messages()
            .position(|m| m.msg_type == msg_type)
    }

    /// The field addressed by `path`, if it exists.
    #[must_use]
    pub fn field(&self, path: FieldPath) -> Option<&Field> {
        self.actions
            .get(path.action)?
            .messages()
            .get(path.message)?
            .fields
            .get(path.field)
    }

    /// Mutable access to the field addressed by `path`.
    pub fn field_mut(&mut self, path: FieldPath) -> Option<&mut Field> {
        self.actions
            .get_mut(path.action)?
            .messages_mut()
            .get_mut(path.message)?
            .fields
            .get_mut(path.field)
    }

    /// Writes this trace as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Loads a trace previously written by [`Trace::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

#[cfg(test)]
mod tests {
    use std::{env, fs};

    use super::{ConnectionEnd, FieldPath, FieldValue, Message, MessageType, Trace};

    #[test]
    fn test_message_fields_follow_descriptors() {
        let msg = Message::new(MessageType::ClientHello, ConnectionEnd::Client);
        let descs = MessageType::ClientHello.field_descriptors();
        assert_eq!(msg.fields.len(), descs.len());
        for (field, desc) in msg.fields.iter().zip(descs) {
            assert_eq!(field.name, desc.name);
            assert!(field.explicit.is_none());
        }
    }

    #[test]
    fn test_handshake_shape() {
        let trace = Trace::client_handshake();
        assert_eq!(trace.actions.len(), 4);
        assert_eq!(trace.send_message_count(), 4);
        assert_eq!(
            trace.first_received(MessageType::ServerHello),
            Some(0),
            "server hello opens the first flight from the server"
        );
        assert_eq!(trace.first_received(MessageType::Heartbeat), None);
    }

    #[test]
    fn test_json_roundtrip_preserves_explicit_values() {
        let mut trace = Trace::client_handshake();
        let path = FieldPath {
            action: 0,
            message: 0,
            field: 0,
        };
        trace.field_mut(path).unwrap().explicit = Some(FieldValue::U16(0x0303));

        let file = env::temp_dir().join("evofuzz_trace_roundtrip.json");
        trace.save(&file).unwrap();
        let loaded = Trace::load(&file).unwrap();
        fs::remove_file(&file).unwrap();

        assert_eq!(loaded.actions.len(), trace.actions.len());
        assert_eq!(loaded, trace);
        assert_eq!(
            loaded.field(path).unwrap().explicit,
            Some(FieldValue::U16(0x0303))
        );
    }
}
