//! Length-prefixed binary packing for forward requests.
//!
//! Wire format: strings are `[4-byte big-endian length][UTF-8 bytes]`,
//! integers are `[4-byte big-endian u32]`. Unpacking consumes from the front
//! of a byte-slice cursor.

use crate::error::{TunnelError, TunnelResult};

/// Out-of-band request type for registering a forward.
pub const TCPIP_FORWARD: &str = "tcpip-forward";

/// Sub-channel type opened toward the peer for each relayed connection.
pub const FORWARDED_TCPIP: &str = "forwarded-tcpip";

/// Append a 4-byte big-endian integer.
pub fn pack_int(payload: &mut Vec<u8>, value: u32) {
    payload.extend_from_slice(&value.to_be_bytes());
}

/// Append a length-prefixed string.
pub fn pack_string(payload: &mut Vec<u8>, value: &str) {
    pack_int(payload, value.len() as u32);
    payload.extend_from_slice(value.as_bytes());
}

/// Consume a 4-byte big-endian integer from the front of `payload`.
pub fn unpack_int(payload: &mut &[u8]) -> TunnelResult<u32> {
    if payload.len() < 4 {
        return Err(TunnelError::TruncatedInput {
            needed: 4,
            available: payload.len(),
        });
    }
    let (head, rest) = payload.split_at(4);
    let value = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    *payload = rest;
    Ok(value)
}

/// Consume a length-prefixed string from the front of `payload`.
///
/// The cursor is only advanced past the length prefix when the string body
/// itself is truncated.
pub fn unpack_string(payload: &mut &[u8]) -> TunnelResult<String> {
    let len = unpack_int(payload)? as usize;
    if len > payload.len() {
        return Err(TunnelError::TruncatedInput {
            needed: len,
            available: payload.len(),
        });
    }
    let (head, rest) = payload.split_at(len);
    let value = std::str::from_utf8(head)
        .map_err(|_| TunnelError::InvalidString)?
        .to_string();
    *payload = rest;
    Ok(value)
}

/// A peer's demand to expose a public listening surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub host: String,
    pub port: u32,
}

impl ForwardRequest {
    pub fn new(host: impl Into<String>, port: u32) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Decode `(host, port)`. Any byte left over is an error.
    pub fn parse(payload: &[u8]) -> TunnelResult<Self> {
        let mut cursor = payload;
        let host = unpack_string(&mut cursor)?;
        let port = unpack_int(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(TunnelError::TrailingData(cursor.len()));
        }
        Ok(Self { host, port })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8 + self.host.len());
        pack_string(&mut payload, &self.host);
        pack_int(&mut payload, self.port);
        payload
    }

    /// `host:port`, as shown to users and logs.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Payload of a `forwarded-tcpip` sub-channel open: the forwarded destination
/// followed by the observed originator of the public connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedTcpip {
    pub host: String,
    pub port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

impl ForwardedTcpip {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        pack_string(&mut payload, &self.host);
        pack_int(&mut payload, self.port);
        pack_string(&mut payload, &self.originator_address);
        pack_int(&mut payload, self.originator_port);
        payload
    }

    pub fn parse(payload: &[u8]) -> TunnelResult<Self> {
        let mut cursor = payload;
        let host = unpack_string(&mut cursor)?;
        let port = unpack_int(&mut cursor)?;
        let originator_address = unpack_string(&mut cursor)?;
        let originator_port = unpack_int(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(TunnelError::TrailingData(cursor.len()));
        }
        Ok(Self {
            host,
            port,
            originator_address,
            originator_port,
        })
    }
}

/// Success reply payload for a dynamically assigned raw forward.
pub fn encode_port_reply(port: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    pack_int(&mut payload, port);
    payload
}
