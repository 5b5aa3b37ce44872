//! Wire format for attach control packets.
//!
//! Every control packet is a fixed six-byte envelope followed by a payload
//! and a flat list of type/length/value extension records:
//!
//! ```text
//! [type: u8][reserved: u8][length: u16][ext length: u16]
//! [payload: (length - ext length) bytes]
//! [extensions: ext length bytes]
//! ```
//!
//! `length` counts every byte after the envelope, `ext length` only the
//! trailing extension block. Each extension record is `[type: u16]
//! [length: u16][value]`. All integers are big-endian. Unknown extension
//! types are skipped when decoding; truncated records are an error.
//!
//! Keep-alive probes use a compact two-byte frame instead: the keep-alive
//! application type followed by a content byte distinguishing request from
//! response.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};

/// Size of the envelope preceding payload and extensions
pub const HEADER_SIZE: usize = 6;

/// Content byte of a keep-alive probe request
pub(crate) const KEEP_ALIVE_REQUEST: u8 = 0x01;
/// Content byte of a keep-alive probe response
pub(crate) const KEEP_ALIVE_RESPONSE: u8 = 0x02;

/// Application-level packet types carried over the secure channel
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ApplicationType {
    /// Keep-alive probe frame
    KeepAlive = 0x04,
    /// Attach-start request/response
    AttachStart = 0x05,
    /// Server-connect-token upload request/response
    TokenUpload = 0x06,
    /// Attach-end request/response
    AttachEnd = 0x07,
}

impl ApplicationType {
    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x04 => Some(Self::KeepAlive),
            0x05 => Some(Self::AttachStart),
            0x06 => Some(Self::TokenUpload),
            0x07 => Some(Self::AttachEnd),
            _ => None,
        }
    }

    /// Whether `byte` belongs to the request/response sub-protocol range
    pub(crate) fn is_request_response(byte: u8) -> bool {
        (Self::AttachStart as u8..=Self::AttachEnd as u8).contains(&byte)
    }
}

/// Extension record types
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u16)]
pub enum ExtensionType {
    /// Product identifier of the device
    ProductId = 0x0001,
    /// Device identifier
    DeviceId = 0x0002,
    /// Application name
    AppName = 0x0003,
    /// Application version
    AppVersion = 0x0004,
    /// One server connect token
    Token = 0x0005,
    /// Hostname of a redirect target
    RedirectHost = 0x0010,
    /// Port of a redirect target
    RedirectPort = 0x0011,
    /// Fingerprint of a redirect target
    RedirectFingerprint = 0x0012,
}

/// Errors from decoding a control packet
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum CodecError {
    /// The packet ended before the announced length
    #[error("unexpected end of packet")]
    UnexpectedEnd,
    /// The application type byte is not one this protocol defines
    #[error("unknown application type {0}")]
    UnknownType(u8),
    /// The packet carried a different application type than required here
    #[error("unexpected application type {0:?}")]
    UnexpectedType(ApplicationType),
    /// The envelope length fields are inconsistent
    #[error("envelope lengths are inconsistent")]
    InvalidLength,
    /// A redirect status without a usable host and port
    #[error("missing or malformed redirect target")]
    InvalidRedirect,
}

impl From<UnexpectedEnd> for CodecError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

/// Incrementally builds one control packet
///
/// The payload, if any, must be written before the first extension.
#[derive(Debug)]
pub struct PacketBuilder {
    buf: BytesMut,
}

impl PacketBuilder {
    /// Start a packet of the given application type with an empty body
    pub fn new(ty: ApplicationType) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.write(ty as u8);
        buf.put_bytes(0, HEADER_SIZE - 1);
        Self { buf }
    }

    /// Append payload bytes
    ///
    /// Fails without modifying the packet if the body would exceed what the
    /// envelope's length field can describe.
    pub fn payload(&mut self, data: &[u8]) -> Result<&mut Self, CodecError> {
        debug_assert_eq!(self.read_len(4), 0, "payload must precede extensions");
        let total = self
            .read_len(2)
            .checked_add(u16::try_from(data.len()).map_err(|_| CodecError::InvalidLength)?)
            .ok_or(CodecError::InvalidLength)?;
        self.buf.put_slice(data);
        self.write_len(2, total);
        Ok(self)
    }

    /// Append one extension record
    ///
    /// Fails without modifying the packet if the body would exceed what the
    /// envelope's length field can describe.
    pub fn extension(&mut self, ty: ExtensionType, value: &[u8]) -> Result<&mut Self, CodecError> {
        let len = u16::try_from(value.len()).map_err(|_| CodecError::InvalidLength)?;
        let added = len.checked_add(4).ok_or(CodecError::InvalidLength)?;
        let total = self
            .read_len(2)
            .checked_add(added)
            .ok_or(CodecError::InvalidLength)?;
        let ext = self
            .read_len(4)
            .checked_add(added)
            .ok_or(CodecError::InvalidLength)?;
        self.buf.write(ty as u16);
        self.buf.write(len);
        self.buf.put_slice(value);
        self.write_len(2, total);
        self.write_len(4, ext);
        Ok(self)
    }

    /// Finish the packet
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    fn read_len(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]])
    }

    fn write_len(&mut self, offset: usize, value: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }
}

/// A decoded control packet envelope
#[derive(Debug, Clone)]
pub struct Packet {
    /// Application type of the packet
    pub ty: ApplicationType,
    /// Payload bytes preceding the extension block
    pub payload: Bytes,
    extensions: Bytes,
}

impl Packet {
    /// Decode the envelope and split payload from extensions
    pub fn decode(mut bytes: Bytes) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::UnexpectedEnd);
        }
        let ty = ApplicationType::from_byte(bytes[0]).ok_or(CodecError::UnknownType(bytes[0]))?;
        let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let ext_len = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        bytes.advance(HEADER_SIZE);
        if ext_len > len {
            return Err(CodecError::InvalidLength);
        }
        if bytes.len() < len {
            return Err(CodecError::UnexpectedEnd);
        }
        let mut body = bytes.split_to(len);
        let payload = body.split_to(len - ext_len);
        Ok(Self {
            ty,
            payload,
            extensions: body,
        })
    }

    /// Iterate over the extension records
    pub fn extensions(&self) -> ExtensionIter {
        ExtensionIter {
            bytes: self.extensions.clone(),
        }
    }
}

/// One extension record
#[derive(Debug, Clone)]
pub struct Extension {
    /// Raw extension type
    pub ty: u16,
    /// Extension value
    pub value: Bytes,
}

/// Iterator over the extension block of a packet
///
/// A truncated record yields an error and ends the iteration.
pub struct ExtensionIter {
    bytes: Bytes,
}

impl Iterator for ExtensionIter {
    type Item = Result<Extension, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.is_empty() {
            return None;
        }
        let mut cursor = self.bytes.clone();
        let record = (|| {
            let ty = cursor.get::<u16>()?;
            let len = cursor.get::<u16>()? as usize;
            if cursor.remaining() < len {
                return Err(UnexpectedEnd);
            }
            Ok(Extension {
                ty,
                value: cursor.split_to(len),
            })
        })();
        match record {
            Ok(ext) => {
                self.bytes = cursor;
                Some(Ok(ext))
            }
            Err(_) => {
                self.bytes.clear();
                Some(Err(CodecError::UnexpectedEnd))
            }
        }
    }
}

/// Result status of an attach-start exchange
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AttachStatus {
    /// The server accepted the attachment
    Attached,
    /// The server directs the device to a different host/port
    Redirect,
    /// Any other status; treated as a failed attach
    Other(u8),
}

impl AttachStatus {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::Attached,
            1 => Self::Redirect,
            other => Self::Other(other),
        }
    }
}

/// Server-issued redirect target
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Redirect {
    /// Hostname to re-resolve and reattach against
    pub host: String,
    /// Port on the redirect target
    pub port: u16,
    /// Fingerprint of the redirect target, if the server supplied one
    pub fingerprint: Option<Bytes>,
}

/// Decoded attach-start response
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AttachResponse {
    /// Status reported by the server
    pub status: AttachStatus,
    /// Redirect target; always present when `status` is `Redirect`
    pub redirect: Option<Redirect>,
}

impl AttachResponse {
    /// Decode a raw attach-start response packet
    ///
    /// A redirect status missing a usable host or port is an error; the
    /// caller treats any decode failure as a transient attach failure.
    pub fn decode(bytes: Bytes) -> Result<Self, CodecError> {
        let packet = Packet::decode(bytes)?;
        if packet.ty != ApplicationType::AttachStart {
            return Err(CodecError::UnexpectedType(packet.ty));
        }
        let mut payload = packet.payload.clone();
        let status = AttachStatus::from_byte(payload.get::<u8>()?);
        let mut host = None;
        let mut port = None;
        let mut fingerprint = None;
        for ext in packet.extensions() {
            let ext = ext?;
            match ext.ty {
                t if t == ExtensionType::RedirectHost as u16 => {
                    let s = std::str::from_utf8(&ext.value)
                        .map_err(|_| CodecError::InvalidRedirect)?;
                    host = Some(s.to_owned());
                }
                t if t == ExtensionType::RedirectPort as u16 => {
                    if ext.value.len() != 2 {
                        return Err(CodecError::InvalidRedirect);
                    }
                    port = Some(u16::from_be_bytes([ext.value[0], ext.value[1]]));
                }
                t if t == ExtensionType::RedirectFingerprint as u16 => {
                    fingerprint = Some(ext.value);
                }
                _ => {}
            }
        }
        let redirect = match status {
            AttachStatus::Redirect => match (host, port) {
                (Some(host), Some(port)) if !host.is_empty() => Some(Redirect {
                    host,
                    port,
                    fingerprint,
                }),
                _ => return Err(CodecError::InvalidRedirect),
            },
            _ => None,
        };
        Ok(Self { status, redirect })
    }
}

/// Device identity advertised in the attach-start request
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Product identifier
    pub product_id: Option<String>,
    /// Device identifier
    pub device_id: Option<String>,
    /// Application name
    pub app_name: Option<String>,
    /// Application version
    pub app_version: Option<String>,
}

/// Build an attach-start request carrying the device identity
pub(crate) fn attach_start_request(identity: &Identity) -> Result<Bytes, CodecError> {
    let mut builder = PacketBuilder::new(ApplicationType::AttachStart);
    if let Some(product_id) = &identity.product_id {
        builder.extension(ExtensionType::ProductId, product_id.as_bytes())?;
    }
    if let Some(device_id) = &identity.device_id {
        builder.extension(ExtensionType::DeviceId, device_id.as_bytes())?;
    }
    if let Some(app_name) = &identity.app_name {
        builder.extension(ExtensionType::AppName, app_name.as_bytes())?;
    }
    if let Some(app_version) = &identity.app_version {
        builder.extension(ExtensionType::AppVersion, app_version.as_bytes())?;
    }
    Ok(builder.finish())
}

/// Build a token-upload request carrying every known token
pub(crate) fn token_upload_request<'a>(
    tokens: impl Iterator<Item = &'a str>,
) -> Result<Bytes, CodecError> {
    let mut builder = PacketBuilder::new(ApplicationType::TokenUpload);
    for token in tokens {
        builder.extension(ExtensionType::Token, token.as_bytes())?;
    }
    Ok(builder.finish())
}

/// Build an attach-end request
pub(crate) fn attach_end_request() -> Bytes {
    PacketBuilder::new(ApplicationType::AttachEnd).finish()
}

/// Build a keep-alive probe request frame
pub(crate) fn keep_alive_request() -> Vec<u8> {
    vec![ApplicationType::KeepAlive as u8, KEEP_ALIVE_REQUEST]
}

/// Build a keep-alive probe response frame
pub(crate) fn keep_alive_response() -> Vec<u8> {
    vec![ApplicationType::KeepAlive as u8, KEEP_ALIVE_RESPONSE]
}
