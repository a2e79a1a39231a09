#![deny(unsafe_code)]

//! Wire schema for the extension envelope.
//!
//! Every extension channel exchanges the same envelope message. The encoding
//! is a protobuf-compatible subset with fixed field numbers, so both peers
//! agree on the layout without negotiating a schema:
//!
//! ```text
//! message Envelope {
//!   bytes  id       = 1;   // 32 bytes, correlates responses to requests
//!   Any    data     = 2;   // { type_url = 1 (string), value = 2 (bytes) }
//!   Options options = 3;   // { oneway = 1 (bool) }
//!   Error  error    = 4;   // { code = 1 (string), message = 2 (string) }
//! }
//! message Buffer { bytes data = 1; }   // wrapper for raw payloads
//! ```
//!
//! Raw byte payloads travel as a `Buffer` message tagged with
//! [`BUFFER_TYPE_URL`], so the same envelope carries both raw and typed data.
//!
//! Top-level decoding is lenient: bytes that do not parse as an envelope
//! decode to an empty [`Envelope`] instead of failing. The session layer
//! treats such frames as unsolicited garbage and drops them.

use std::collections::BTreeSet;
use std::fmt;

use sha2::{Digest, Sha256};

/// Type URL tagging raw byte payloads wrapped as a `Buffer` message.
pub const BUFFER_TYPE_URL: &str = "dxos.protocol.Buffer";

/// Length of an envelope id in bytes.
pub const CALL_ID_LEN: usize = 32;

// ============================================================================
// Envelope model
// ============================================================================

/// Decoded envelope as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    /// 32 random bytes correlating a response to its request. Present on
    /// one-way sends too, even though no response will reference it.
    pub id: Vec<u8>,
    /// Payload, if any.
    pub data: Option<AnyPayload>,
    /// Per-message options.
    pub options: EnvelopeOptions,
    /// Present only on error responses.
    pub error: Option<ErrorDetail>,
}

impl Envelope {
    /// The id as a fixed-length key, if it has the expected length.
    pub fn call_id(&self) -> Option<[u8; CALL_ID_LEN]> {
        <[u8; CALL_ID_LEN]>::try_from(self.id.as_slice()).ok()
    }
}

/// String-tagged payload, the `Any` of the wire schema.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnyPayload {
    pub type_url: String,
    pub value: Vec<u8>,
}

/// Per-message options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvelopeOptions {
    /// If set on a request, the receiver must not respond and the sender
    /// keeps no pending-call entry.
    pub oneway: bool,
}

/// Error carried by an error response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ============================================================================
// Payload (session-facing view of `data`)
// ============================================================================

/// Decoded payload handed to extension handlers.
///
/// Raw bytes and typed messages share the envelope; the codec dispatches on
/// the `type_url` tag and unwraps the `Buffer` framing for raw payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw bytes (wire-wrapped as a `Buffer` message).
    Bytes(Vec<u8>),
    /// A message from a schema registered on the extension. The value stays
    /// encoded; interpreting it is the handler's business.
    Typed { type_url: String, value: Vec<u8> },
}

impl Payload {
    /// Raw bytes of a [`Payload::Bytes`] value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            Payload::Typed { .. } => None,
        }
    }

    /// The type URL this payload travels under.
    pub fn type_url(&self) -> &str {
        match self {
            Payload::Bytes(_) => BUFFER_TYPE_URL,
            Payload::Typed { type_url, .. } => type_url,
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Payload {
    fn from(bytes: &[u8; N]) -> Self {
        Payload::Bytes(bytes.to_vec())
    }
}

/// Set of type URLs an extension accepts in structured mode.
///
/// An empty schema means raw-buffer mode: only `Buffer`-wrapped payloads are
/// accepted.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    type_urls: BTreeSet<String>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type URL.
    pub fn with_type(mut self, type_url: impl Into<String>) -> Self {
        self.type_urls.insert(type_url.into());
        self
    }

    pub fn contains(&self, type_url: &str) -> bool {
        self.type_urls.contains(type_url)
    }

    pub fn is_empty(&self) -> bool {
        self.type_urls.is_empty()
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Result of decoding the `data` field against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedData {
    /// No payload was present.
    Empty,
    /// A payload the schema accepts.
    Payload(Payload),
    /// A type URL the schema does not know. Carries the offending tag.
    UnknownType(String),
}

/// An envelope decoded against a per-extension schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub id: Vec<u8>,
    pub data: DecodedData,
    pub oneway: bool,
    pub error: Option<ErrorDetail>,
}

impl Decoded {
    /// The id as a fixed-length key, if it has the expected length.
    pub fn call_id(&self) -> Option<[u8; CALL_ID_LEN]> {
        <[u8; CALL_ID_LEN]>::try_from(self.id.as_slice()).ok()
    }
}

/// Per-extension envelope codec carrying the registered schema.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec {
    schema: Schema,
}

impl EnvelopeCodec {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    /// Whether a payload may be sent through this codec.
    ///
    /// Raw bytes are always sendable; typed payloads must carry a registered
    /// type URL.
    pub fn accepts(&self, payload: &Payload) -> bool {
        match payload {
            Payload::Bytes(_) => true,
            Payload::Typed { type_url, .. } => self.schema.contains(type_url),
        }
    }

    /// Encode a message envelope.
    pub fn encode_message(&self, id: &[u8], payload: &Payload, oneway: bool) -> Vec<u8> {
        let envelope = Envelope {
            id: id.to_vec(),
            data: Some(wrap_payload(payload)),
            options: EnvelopeOptions { oneway },
            error: None,
        };
        encode_envelope(&envelope)
    }

    /// Encode an error response envelope.
    pub fn encode_error(&self, id: &[u8], code: &str, message: &str) -> Vec<u8> {
        let envelope = Envelope {
            id: id.to_vec(),
            data: None,
            options: EnvelopeOptions::default(),
            error: Some(ErrorDetail {
                code: code.to_owned(),
                message: message.to_owned(),
            }),
        };
        encode_envelope(&envelope)
    }

    /// Decode an envelope and dispatch its payload against the schema.
    pub fn decode(&self, bytes: &[u8]) -> Decoded {
        let envelope = decode_envelope(bytes);
        let data = match envelope.data {
            None => DecodedData::Empty,
            Some(any) if any.type_url == BUFFER_TYPE_URL => match unwrap_buffer(&any.value) {
                Some(bytes) => DecodedData::Payload(Payload::Bytes(bytes)),
                None => DecodedData::UnknownType(any.type_url),
            },
            Some(any) if self.schema.contains(&any.type_url) => {
                DecodedData::Payload(Payload::Typed {
                    type_url: any.type_url,
                    value: any.value,
                })
            }
            Some(any) => DecodedData::UnknownType(any.type_url),
        };
        Decoded {
            id: envelope.id,
            data,
            oneway: envelope.options.oneway,
            error: envelope.error,
        }
    }
}

/// Wrap a payload into the wire `Any` representation.
fn wrap_payload(payload: &Payload) -> AnyPayload {
    match payload {
        Payload::Bytes(bytes) => AnyPayload {
            type_url: BUFFER_TYPE_URL.to_owned(),
            value: encode_buffer(bytes),
        },
        Payload::Typed { type_url, value } => AnyPayload {
            type_url: type_url.clone(),
            value: value.clone(),
        },
    }
}

// ============================================================================
// Init-gate alphabet
// ============================================================================

/// The three-symbol mini-protocol spoken on the built-in init extension.
///
/// Payloads are the literal ASCII tokens, not an encoded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitCommand {
    /// Local extensions initialized successfully.
    Valid,
    /// Local extensions failed to initialize; the connection is vetoed.
    Invalid,
    /// Follow-up after `Invalid`: tear the stream down.
    Destroy,
}

impl InitCommand {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            InitCommand::Valid => b"valid",
            InitCommand::Invalid => b"invalid",
            InitCommand::Destroy => b"destroy",
        }
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"valid" => Some(InitCommand::Valid),
            b"invalid" => Some(InitCommand::Invalid),
            b"destroy" => Some(InitCommand::Destroy),
            _ => None,
        }
    }
}

// ============================================================================
// Discovery keys
// ============================================================================

/// Derive the discovery key a peer announces for a feed key.
///
/// Peers reference feeds by discovery key only, so an observer who does not
/// hold the key cannot learn it from the wire.
pub fn discovery_key(key: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"tether:discovery:");
    hasher.update(key);
    hasher.finalize().into()
}

// ============================================================================
// Envelope encoding
// ============================================================================

const FIELD_ID: u32 = 1;
const FIELD_DATA: u32 = 2;
const FIELD_OPTIONS: u32 = 3;
const FIELD_ERROR: u32 = 4;

const ANY_TYPE_URL: u32 = 1;
const ANY_VALUE: u32 = 2;

const OPTIONS_ONEWAY: u32 = 1;

const ERROR_CODE: u32 = 1;
const ERROR_MESSAGE: u32 = 2;

const BUFFER_DATA: u32 = 1;

const WIRE_VARINT: u32 = 0;
const WIRE_I64: u32 = 1;
const WIRE_LEN: u32 = 2;
const WIRE_I32: u32 = 5;

/// Encode an envelope. Fields with default values are omitted, proto3-style.
pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + envelope.id.len());
    if !envelope.id.is_empty() {
        put_bytes_field(&mut out, FIELD_ID, &envelope.id);
    }
    if let Some(data) = &envelope.data {
        put_bytes_field(&mut out, FIELD_DATA, &encode_any(data));
    }
    if envelope.options.oneway {
        let mut options = Vec::with_capacity(2);
        put_bool_field(&mut options, OPTIONS_ONEWAY, true);
        put_bytes_field(&mut out, FIELD_OPTIONS, &options);
    }
    if let Some(error) = &envelope.error {
        let mut detail = Vec::with_capacity(error.code.len() + error.message.len() + 4);
        if !error.code.is_empty() {
            put_bytes_field(&mut detail, ERROR_CODE, error.code.as_bytes());
        }
        if !error.message.is_empty() {
            put_bytes_field(&mut detail, ERROR_MESSAGE, error.message.as_bytes());
        }
        put_bytes_field(&mut out, FIELD_ERROR, &detail);
    }
    out
}

/// Decode an envelope. Malformed input yields an empty envelope rather than
/// an error; unknown fields are skipped.
pub fn decode_envelope(bytes: &[u8]) -> Envelope {
    try_decode_envelope(bytes).unwrap_or_default()
}

fn try_decode_envelope(bytes: &[u8]) -> Option<Envelope> {
    let mut envelope = Envelope::default();
    let mut pos = 0;
    while pos < bytes.len() {
        let (field, wire) = get_tag(bytes, &mut pos)?;
        match (field, wire) {
            (FIELD_ID, WIRE_LEN) => envelope.id = get_bytes(bytes, &mut pos)?.to_vec(),
            (FIELD_DATA, WIRE_LEN) => {
                envelope.data = Some(decode_any(get_bytes(bytes, &mut pos)?)?);
            }
            (FIELD_OPTIONS, WIRE_LEN) => {
                envelope.options = decode_options(get_bytes(bytes, &mut pos)?)?;
            }
            (FIELD_ERROR, WIRE_LEN) => {
                envelope.error = Some(decode_error(get_bytes(bytes, &mut pos)?)?);
            }
            (_, wire) => skip_field(bytes, &mut pos, wire)?,
        }
    }
    Some(envelope)
}

fn encode_any(any: &AnyPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(any.type_url.len() + any.value.len() + 4);
    if !any.type_url.is_empty() {
        put_bytes_field(&mut out, ANY_TYPE_URL, any.type_url.as_bytes());
    }
    if !any.value.is_empty() {
        put_bytes_field(&mut out, ANY_VALUE, &any.value);
    }
    out
}

fn decode_any(bytes: &[u8]) -> Option<AnyPayload> {
    let mut any = AnyPayload::default();
    let mut pos = 0;
    while pos < bytes.len() {
        let (field, wire) = get_tag(bytes, &mut pos)?;
        match (field, wire) {
            (ANY_TYPE_URL, WIRE_LEN) => {
                any.type_url = String::from_utf8(get_bytes(bytes, &mut pos)?.to_vec()).ok()?;
            }
            (ANY_VALUE, WIRE_LEN) => any.value = get_bytes(bytes, &mut pos)?.to_vec(),
            (_, wire) => skip_field(bytes, &mut pos, wire)?,
        }
    }
    Some(any)
}

fn decode_options(bytes: &[u8]) -> Option<EnvelopeOptions> {
    let mut options = EnvelopeOptions::default();
    let mut pos = 0;
    while pos < bytes.len() {
        let (field, wire) = get_tag(bytes, &mut pos)?;
        match (field, wire) {
            (OPTIONS_ONEWAY, WIRE_VARINT) => options.oneway = get_uvarint(bytes, &mut pos)? != 0,
            (_, wire) => skip_field(bytes, &mut pos, wire)?,
        }
    }
    Some(options)
}

fn decode_error(bytes: &[u8]) -> Option<ErrorDetail> {
    let mut error = ErrorDetail::default();
    let mut pos = 0;
    while pos < bytes.len() {
        let (field, wire) = get_tag(bytes, &mut pos)?;
        match (field, wire) {
            (ERROR_CODE, WIRE_LEN) => {
                error.code = String::from_utf8(get_bytes(bytes, &mut pos)?.to_vec()).ok()?;
            }
            (ERROR_MESSAGE, WIRE_LEN) => {
                error.message = String::from_utf8(get_bytes(bytes, &mut pos)?.to_vec()).ok()?;
            }
            (_, wire) => skip_field(bytes, &mut pos, wire)?,
        }
    }
    Some(error)
}

/// Encode raw bytes as a `Buffer` message.
pub fn encode_buffer(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    if !data.is_empty() {
        put_bytes_field(&mut out, BUFFER_DATA, data);
    }
    out
}

/// Decode a `Buffer` message back into raw bytes.
pub fn unwrap_buffer(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut data = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let (field, wire) = get_tag(bytes, &mut pos)?;
        match (field, wire) {
            (BUFFER_DATA, WIRE_LEN) => data = get_bytes(bytes, &mut pos)?.to_vec(),
            (_, wire) => skip_field(bytes, &mut pos, wire)?,
        }
    }
    Some(data)
}

// ============================================================================
// Primitive wire helpers
// ============================================================================

fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn get_uvarint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
}

fn put_tag(buf: &mut Vec<u8>, field: u32, wire: u32) {
    put_uvarint(buf, u64::from(field << 3 | wire));
}

fn get_tag(buf: &[u8], pos: &mut usize) -> Option<(u32, u32)> {
    let tag = get_uvarint(buf, pos)?;
    let field = u32::try_from(tag >> 3).ok()?;
    if field == 0 {
        return None;
    }
    Some((field, (tag & 0x7) as u32))
}

fn put_bytes_field(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_uvarint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn put_bool_field(buf: &mut Vec<u8>, field: u32, value: bool) {
    if value {
        put_tag(buf, field, WIRE_VARINT);
        put_uvarint(buf, 1);
    }
}

fn get_bytes<'a>(buf: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let len = usize::try_from(get_uvarint(buf, pos)?).ok()?;
    let end = pos.checked_add(len)?;
    if end > buf.len() {
        return None;
    }
    let slice = &buf[*pos..end];
    *pos = end;
    Some(slice)
}

fn skip_field(buf: &[u8], pos: &mut usize, wire: u32) -> Option<()> {
    match wire {
        WIRE_VARINT => {
            get_uvarint(buf, pos)?;
        }
        WIRE_I64 => {
            let end = pos.checked_add(8)?;
            if end > buf.len() {
                return None;
            }
            *pos = end;
        }
        WIRE_LEN => {
            get_bytes(buf, pos)?;
        }
        WIRE_I32 => {
            let end = pos.checked_add(4)?;
            if end > buf.len() {
                return None;
            }
            *pos = end;
        }
        _ => return None,
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id() -> Vec<u8> {
        vec![0xAA; CALL_ID_LEN]
    }

    #[test]
    fn envelope_round_trip_with_buffer_payload() {
        let envelope = Envelope {
            id: sample_id(),
            data: Some(AnyPayload {
                type_url: BUFFER_TYPE_URL.to_owned(),
                value: encode_buffer(b"ping"),
            }),
            options: EnvelopeOptions { oneway: false },
            error: None,
        };
        let bytes = encode_envelope(&envelope);
        assert_eq!(decode_envelope(&bytes), envelope);
    }

    #[test]
    fn envelope_round_trip_with_error() {
        let envelope = Envelope {
            id: sample_id(),
            data: None,
            options: EnvelopeOptions { oneway: false },
            error: Some(ErrorDetail {
                code: "ERR_SYSTEM".to_owned(),
                message: "Invalid data.".to_owned(),
            }),
        };
        let bytes = encode_envelope(&envelope);
        assert_eq!(decode_envelope(&bytes), envelope);
    }

    #[test]
    fn envelope_round_trip_oneway() {
        let envelope = Envelope {
            id: sample_id(),
            data: Some(AnyPayload {
                type_url: BUFFER_TYPE_URL.to_owned(),
                value: encode_buffer(b"fire-and-forget"),
            }),
            options: EnvelopeOptions { oneway: true },
            error: None,
        };
        let bytes = encode_envelope(&envelope);
        assert_eq!(decode_envelope(&bytes), envelope);
    }

    // Pins the exact byte layout. A change here is a wire format break.
    #[test]
    fn envelope_golden_vector() {
        let envelope = Envelope {
            id: sample_id(),
            data: Some(AnyPayload {
                type_url: BUFFER_TYPE_URL.to_owned(),
                value: encode_buffer(b"ping"),
            }),
            options: EnvelopeOptions { oneway: false },
            error: None,
        };

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0x0A, 32]); // id: field 1, len 32
        expected.extend_from_slice(&[0xAA; 32]);
        expected.extend_from_slice(&[0x12, 30]); // data: field 2, len 30
        expected.extend_from_slice(&[0x0A, 20]); // type_url: field 1, len 20
        expected.extend_from_slice(b"dxos.protocol.Buffer");
        expected.extend_from_slice(&[0x12, 6]); // value: field 2, len 6
        expected.extend_from_slice(&[0x0A, 4]); // Buffer.data: field 1, len 4
        expected.extend_from_slice(b"ping");

        assert_eq!(encode_envelope(&envelope), expected);
    }

    #[test]
    fn oneway_flag_golden_vector() {
        let envelope = Envelope {
            id: Vec::new(),
            data: None,
            options: EnvelopeOptions { oneway: true },
            error: None,
        };
        // options: field 3, len 2; oneway: field 1 varint 1
        assert_eq!(encode_envelope(&envelope), vec![0x1A, 0x02, 0x08, 0x01]);
    }

    #[test]
    fn invalid_bytes_decode_to_empty_envelope() {
        assert_eq!(decode_envelope(&[0xFF, 0xFF, 0xFF]), Envelope::default());
        // Truncated length-delimited field.
        assert_eq!(decode_envelope(&[0x0A, 0x20, 0x01]), Envelope::default());
        assert_eq!(decode_envelope(&[]), Envelope::default());
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let envelope = Envelope {
            id: sample_id(),
            ..Envelope::default()
        };
        let mut bytes = encode_envelope(&envelope);
        // Append field 9 (varint) and field 10 (length-delimited).
        bytes.extend_from_slice(&[0x48, 0x07]);
        bytes.extend_from_slice(&[0x52, 0x03, 0x01, 0x02, 0x03]);
        assert_eq!(decode_envelope(&bytes), envelope);
    }

    #[test]
    fn buffer_wrapping_round_trips() {
        let wrapped = encode_buffer(b"hello");
        assert_eq!(unwrap_buffer(&wrapped), Some(b"hello".to_vec()));
        assert_eq!(unwrap_buffer(&encode_buffer(b"")), Some(Vec::new()));
    }

    #[test]
    fn codec_dispatches_registered_type_url() {
        let schema = Schema::new().with_type("example.Presence");
        let codec = EnvelopeCodec::new(schema);

        let payload = Payload::Typed {
            type_url: "example.Presence".to_owned(),
            value: vec![1, 2, 3],
        };
        let bytes = codec.encode_message(&sample_id(), &payload, false);
        let decoded = codec.decode(&bytes);
        assert_eq!(decoded.data, DecodedData::Payload(payload));
        assert!(!decoded.oneway);
    }

    #[test]
    fn codec_flags_unknown_type_url() {
        let codec = EnvelopeCodec::new(Schema::new().with_type("example.Presence"));
        let stranger = EnvelopeCodec::new(Schema::new().with_type("example.Chat"));

        let payload = Payload::Typed {
            type_url: "example.Chat".to_owned(),
            value: vec![9],
        };
        let bytes = stranger.encode_message(&sample_id(), &payload, false);
        let decoded = codec.decode(&bytes);
        assert_eq!(
            decoded.data,
            DecodedData::UnknownType("example.Chat".to_owned())
        );
    }

    #[test]
    fn codec_accepts_raw_bytes_in_any_mode() {
        let codec = EnvelopeCodec::new(Schema::new().with_type("example.Presence"));
        let bytes = codec.encode_message(&sample_id(), &Payload::Bytes(b"raw".to_vec()), true);
        let decoded = codec.decode(&bytes);
        assert_eq!(decoded.data, DecodedData::Payload(Payload::Bytes(b"raw".to_vec())));
        assert!(decoded.oneway);
    }

    #[test]
    fn codec_rejects_unregistered_type_on_send() {
        let codec = EnvelopeCodec::new(Schema::new());
        assert!(codec.accepts(&Payload::Bytes(b"ok".to_vec())));
        assert!(!codec.accepts(&Payload::Typed {
            type_url: "example.Unknown".to_owned(),
            value: Vec::new(),
        }));
    }

    #[test]
    fn error_response_decodes_against_any_schema() {
        let codec = EnvelopeCodec::new(Schema::new());
        let bytes = codec.encode_error(&sample_id(), "ERR_SYSTEM", "boom");
        let decoded = codec.decode(&bytes);
        let error = decoded.error.expect("error detail");
        assert_eq!(error.code, "ERR_SYSTEM");
        assert_eq!(error.message, "boom");
        assert_eq!(decoded.data, DecodedData::Empty);
    }

    #[test]
    fn init_command_alphabet() {
        for command in [InitCommand::Valid, InitCommand::Invalid, InitCommand::Destroy] {
            assert_eq!(InitCommand::parse(command.as_bytes()), Some(command));
        }
        assert_eq!(InitCommand::parse(b"bogus"), None);
        assert_eq!(InitCommand::Valid.as_bytes(), b"valid");
        assert_eq!(InitCommand::Invalid.as_bytes(), b"invalid");
        assert_eq!(InitCommand::Destroy.as_bytes(), b"destroy");
    }

    #[test]
    fn discovery_key_is_stable_and_distinct() {
        let a = discovery_key(&[1; 32]);
        let b = discovery_key(&[1; 32]);
        let c = discovery_key(&[2; 32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, [1; 32]);
    }

    #[test]
    fn varint_boundaries() {
        for value in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(get_uvarint(&buf, &mut pos), Some(value));
            assert_eq!(pos, buf.len());
        }
    }
}
