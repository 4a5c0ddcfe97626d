//! CoAP message types and wire codec for CORECONF
//!
//! Covers the subset of RFC 7252 / RFC 7959 the device speaks: the fixed
//! header, token, delta-encoded options (Uri-Path, Content-Format,
//! Uri-Query, Accept, Block2, Size2) and payload.

use crate::error::{CoreconfError, Result};

/// CoAP Content-Format identifiers for CORECONF
/// See: https://www.rfc-editor.org/rfc/rfc9254#section-9.3
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ContentFormat {
    /// application/yang-data+cbor; id=sid
    YangDataCborSid = 140,
    /// application/yang-identifiers+cbor-seq
    YangIdentifiersCborSeq = 141,
    /// application/yang-instances+cbor-seq
    YangInstancesCborSeq = 142,
}

impl ContentFormat {
    /// Convert from raw content-format ID
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            140 => Some(Self::YangDataCborSid),
            141 => Some(Self::YangIdentifiersCborSeq),
            142 => Some(Self::YangInstancesCborSeq),
            _ => None,
        }
    }

    /// Get the raw content-format ID
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// CORECONF request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Retrieve full datastore
    Get,
    /// Invoke RPC or Action
    Post,
    /// Retrieve data nodes (RFC 8132)
    Fetch,
    /// Modify data nodes (RFC 8132)
    IPatch,
}

impl Method {
    /// Request code byte (class 0)
    pub fn code(self) -> u8 {
        match self {
            Method::Get => 1,
            Method::Post => 2,
            Method::Fetch => 5,
            Method::IPatch => 7,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
            Method::Fetch => f.write_str("FETCH"),
            Method::IPatch => f.write_str("iPATCH"),
        }
    }
}

/// CoAP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Confirmable => 0,
            Self::NonConfirmable => 1,
            Self::Acknowledgement => 2,
            Self::Reset => 3,
        }
    }
}

/// Raw CoAP code byte (`class.detail`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(pub u8);

impl ResponseCode {
    /// 2.01 Created
    pub const CREATED: Self = Self::new(2, 1);
    /// 2.04 Changed
    pub const CHANGED: Self = Self::new(2, 4);
    /// 2.05 Content
    pub const CONTENT: Self = Self::new(2, 5);
    /// 4.00 Bad Request
    pub const BAD_REQUEST: Self = Self::new(4, 0);
    /// 4.04 Not Found
    pub const NOT_FOUND: Self = Self::new(4, 4);
    /// 4.08 Request Entity Incomplete
    pub const REQUEST_ENTITY_INCOMPLETE: Self = Self::new(4, 8);
    /// 4.09 Conflict (YANG validation error)
    pub const CONFLICT: Self = Self::new(4, 9);
    /// 5.00 Internal Server Error
    pub const INTERNAL_SERVER_ERROR: Self = Self::new(5, 0);

    pub const fn new(class: u8, detail: u8) -> Self {
        Self((class << 5) | (detail & 0x1F))
    }

    /// Convert to CoAP response code format (class.detail)
    pub fn to_code_pair(self) -> (u8, u8) {
        (self.0 >> 5, self.0 & 0x1F)
    }

    /// Check if this is a success code
    pub fn is_success(self) -> bool {
        self.0 >> 5 == 2
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (class, detail) = self.to_code_pair();
        write!(f, "{}.{:02}", class, detail)
    }
}

/// Option numbers in use
pub mod option {
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const URI_QUERY: u16 = 15;
    pub const ACCEPT: u16 = 17;
    pub const BLOCK2: u16 = 23;
    pub const SIZE2: u16 = 28;
}

/// A single option instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

impl CoapOption {
    pub fn new(number: u16, value: impl Into<Vec<u8>>) -> Self {
        Self {
            number,
            value: value.into(),
        }
    }

    /// Option carrying an unsigned integer in minimal big-endian form
    pub fn uint(number: u16, value: u32) -> Self {
        Self::new(number, encode_uint(value))
    }

    pub fn as_uint(&self) -> Option<u32> {
        decode_uint(&self.value)
    }
}

fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(4);
    bytes[first..].to_vec()
}

fn decode_uint(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > 4 {
        return None;
    }
    Some(bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
}

/// Block2 option value (RFC 7959)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block2 {
    pub num: u32,
    pub more: bool,
    pub szx: u8,
}

impl Block2 {
    pub fn new(num: u32, more: bool, szx: u8) -> Self {
        Self { num, more, szx }
    }

    /// Block size in bytes
    pub fn size(self) -> usize {
        1usize << (self.szx + 4)
    }

    pub fn to_option(self) -> CoapOption {
        let value = (self.num << 4) | (u32::from(self.more) << 3) | u32::from(self.szx & 0x07);
        CoapOption::uint(option::BLOCK2, value)
    }

    pub fn from_option(opt: &CoapOption) -> Result<Self> {
        let value = opt
            .as_uint()
            .ok_or_else(|| CoreconfError::MalformedMessage("Block2 option too long".into()))?;
        let szx = (value & 0x07) as u8;
        if szx == 7 {
            return Err(CoreconfError::MalformedMessage("reserved Block2 SZX 7".into()));
        }
        Ok(Self {
            num: value >> 4,
            more: value & 0x08 != 0,
            szx,
        })
    }
}

/// A CoAP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub code: u8,
    pub message_id: u16,
    pub token: Vec<u8>,
    /// Kept sorted by option number when built
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

const PAYLOAD_MARKER: u8 = 0xFF;

impl Message {
    /// Confirmable request
    pub fn request(method: Method, message_id: u16, token: Vec<u8>) -> Self {
        Self {
            message_type: MessageType::Confirmable,
            code: method.code(),
            message_id,
            token,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn add_option(&mut self, opt: CoapOption) {
        self.options.push(opt);
    }

    /// Add one Uri-Path option per path segment
    pub fn set_path(&mut self, path: &str) {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::new(option::URI_PATH, segment.as_bytes()));
        }
    }

    /// Add one Uri-Query option per `&`-separated argument
    pub fn set_query(&mut self, query: &str) {
        for arg in query.split('&').filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::new(option::URI_QUERY, arg.as_bytes()));
        }
    }

    pub fn set_payload(&mut self, payload: Vec<u8>, format: ContentFormat) {
        self.add_option(CoapOption::uint(
            option::CONTENT_FORMAT,
            u32::from(format.as_u16()),
        ));
        self.payload = payload;
    }

    pub fn find_option(&self, number: u16) -> Option<&CoapOption> {
        self.options.iter().find(|o| o.number == number)
    }

    pub fn response_code(&self) -> ResponseCode {
        ResponseCode(self.code)
    }

    /// Serialize to wire bytes with options in canonical order
    pub fn build(&self) -> Result<Vec<u8>> {
        if self.token.len() > 8 {
            return Err(CoreconfError::MalformedMessage(format!(
                "token of {} bytes exceeds 8",
                self.token.len()
            )));
        }

        let mut out = Vec::with_capacity(4 + self.token.len() + self.payload.len() + 16);
        out.push(0x40 | (self.message_type.bits() << 4) | self.token.len() as u8);
        out.push(self.code);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token);

        // Stable sort keeps repeated options (Uri-Path) in insertion order.
        let mut options: Vec<&CoapOption> = self.options.iter().collect();
        options.sort_by_key(|o| o.number);

        let mut previous = 0u16;
        for opt in options {
            let delta = opt.number - previous;
            previous = opt.number;
            let len = opt.value.len();
            if len > 269 + 0xFFFF {
                return Err(CoreconfError::MalformedMessage(format!(
                    "option {} value too long",
                    opt.number
                )));
            }

            let (delta_nibble, delta_ext) = option_nibble(u32::from(delta));
            let (len_nibble, len_ext) = option_nibble(len as u32);
            out.push((delta_nibble << 4) | len_nibble);
            out.extend_from_slice(&delta_ext);
            out.extend_from_slice(&len_ext);
            out.extend_from_slice(&opt.value);
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }
        Ok(out)
    }

    /// Parse wire bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let malformed = |what: &str| CoreconfError::MalformedMessage(what.to_string());

        if bytes.len() < 4 {
            return Err(malformed("shorter than the fixed header"));
        }
        if bytes[0] >> 6 != 1 {
            return Err(malformed("unsupported CoAP version"));
        }
        let message_type = MessageType::from_bits(bytes[0] >> 4);
        let tkl = usize::from(bytes[0] & 0x0F);
        if tkl > 8 {
            return Err(malformed("token length above 8"));
        }
        let code = bytes[1];
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);
        let token = bytes
            .get(4..4 + tkl)
            .ok_or_else(|| malformed("truncated token"))?
            .to_vec();

        let mut pos = 4 + tkl;
        let mut options = Vec::new();
        let mut number = 0u32;
        let mut payload = Vec::new();

        while pos < bytes.len() {
            let head = bytes[pos];
            pos += 1;
            if head == PAYLOAD_MARKER {
                if pos == bytes.len() {
                    return Err(malformed("payload marker without payload"));
                }
                payload = bytes[pos..].to_vec();
                break;
            }

            let delta = read_extended(head >> 4, bytes, &mut pos)?;
            let len = read_extended(head & 0x0F, bytes, &mut pos)? as usize;
            number += delta;
            let number = u16::try_from(number).map_err(|_| malformed("option number overflow"))?;
            let value = bytes
                .get(pos..pos + len)
                .ok_or_else(|| malformed("truncated option value"))?;
            pos += len;
            options.push(CoapOption::new(number, value));
        }

        Ok(Self {
            message_type,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

fn option_nibble(value: u32) -> (u8, Vec<u8>) {
    match value {
        0..=12 => (value as u8, Vec::new()),
        13..=268 => (13, vec![(value - 13) as u8]),
        _ => (14, ((value - 269) as u16).to_be_bytes().to_vec()),
    }
}

fn read_extended(nibble: u8, bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let malformed = |what: &str| CoreconfError::MalformedMessage(what.to_string());
    match nibble {
        0..=12 => Ok(u32::from(nibble)),
        13 => {
            let b = *bytes.get(*pos).ok_or_else(|| malformed("truncated option"))?;
            *pos += 1;
            Ok(u32::from(b) + 13)
        }
        14 => {
            let ext = bytes
                .get(*pos..*pos + 2)
                .ok_or_else(|| malformed("truncated option"))?;
            *pos += 2;
            Ok(u32::from(u16::from_be_bytes([ext[0], ext[1]])) + 269)
        }
        _ => Err(malformed("reserved option nibble 15")),
    }
}

/// A parsed CORECONF response
#[derive(Debug, Clone)]
pub struct Response {
    /// Response code
    pub code: ResponseCode,
    /// CBOR-encoded payload
    pub payload: Vec<u8>,
    /// Content format of the payload
    pub content_format: Option<ContentFormat>,
    /// Block2 option, when the response is one block of a larger body
    pub block2: Option<Block2>,
    /// Total body size announced by the server
    pub size2: Option<u32>,
}

impl Response {
    pub fn from_message(message: &Message) -> Result<Self> {
        let block2 = message
            .find_option(option::BLOCK2)
            .map(Block2::from_option)
            .transpose()?;
        Ok(Self {
            code: message.response_code(),
            payload: message.payload.clone(),
            content_format: message
                .find_option(option::CONTENT_FORMAT)
                .and_then(CoapOption::as_uint)
                .and_then(|v| u16::try_from(v).ok())
                .and_then(ContentFormat::from_u16),
            block2,
            size2: message
                .find_option(option::SIZE2)
                .and_then(CoapOption::as_uint),
        })
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Human-readable rendering of an error payload
    pub fn diagnostic(&self) -> Option<String> {
        if self.payload.is_empty() {
            return None;
        }
        if let Ok(value) = ciborium::from_reader::<ciborium::Value, _>(self.payload.as_slice())
            && let Ok(json) = serde_json::to_string(&value)
        {
            return Some(json);
        }
        Some(String::from_utf8_lossy(&self.payload).into_owned())
    }

    /// Turn a non-2.xx response into a protocol error
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(CoreconfError::Protocol {
                code: self.code.to_string(),
                diagnostic: self.diagnostic(),
            })
        }
    }
}

/// Query parameter 'c' (content) values
/// Controls how descendant nodes are processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentParam {
    /// Return all descendant data nodes
    #[default]
    All,
    /// Return only configuration data nodes
    Config,
    /// Return only non-configuration data nodes
    Nonconfig,
}

/// Query parameter 'd' (with-defaults) values
/// Controls how default values are processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultsParam {
    /// Report-all mode
    #[default]
    All,
    /// Trim mode - don't report defaults
    Trim,
}

/// CORECONF query parameters for datastore reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryParams {
    pub content: ContentParam,
    pub defaults: DefaultsParam,
}

impl QueryParams {
    /// Render as a Uri-Query string (`c=c&d=t`); empty when all defaults
    pub fn to_query_string(&self) -> String {
        let mut parts = Vec::new();
        match self.content {
            ContentParam::All => {}
            ContentParam::Config => parts.push("c=c"),
            ContentParam::Nonconfig => parts.push("c=n"),
        }
        if self.defaults == DefaultsParam::Trim {
            parts.push("d=t");
        }
        parts.join("&")
    }
}
