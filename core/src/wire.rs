//! Wire body for envelopes crossing a process boundary.
//!
//! Body format: `[id_len:1][correlation_id][slug_len:2][type_slug][payload:N]`
//!
//! - **id_len**: length of the correlation id text (u8)
//! - **correlation_id**: UTF-8 text form of the id
//! - **slug_len**: length of the type slug (little-endian u16)
//! - **type_slug**: UTF-8 registered name of the payload type
//! - **payload**: codec output for the payload
//!
//! Transports add their own length prefix around the body.

use bytes::{BufMut, Bytes, BytesMut};

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData { needed: usize, have: usize },

    #[error("correlation id too long: {0} bytes")]
    IdTooLong(usize),

    #[error("type slug too long: {0} bytes")]
    SlugTooLong(usize),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

/// Decoded frame body. The payload is still codec-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub correlation_id: String,
    pub type_slug: String,
    pub payload: Bytes,
}

impl WireFrame {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let id = self.correlation_id.as_bytes();
        let slug = self.type_slug.as_bytes();
        let id_len = u8::try_from(id.len()).map_err(|_| WireError::IdTooLong(id.len()))?;
        let slug_len =
            u16::try_from(slug.len()).map_err(|_| WireError::SlugTooLong(slug.len()))?;

        let mut buf = BytesMut::with_capacity(3 + id.len() + slug.len() + self.payload.len());
        buf.put_u8(id_len);
        buf.put_slice(id);
        buf.put_u16_le(slug_len);
        buf.put_slice(slug);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let (id_len, rest) = split_at(data, 1)?;
        let (id, rest) = split_at(rest, id_len[0] as usize)?;
        let (slug_len, rest) = split_at(rest, 2)?;
        let slug_len = u16::from_le_bytes([slug_len[0], slug_len[1]]) as usize;
        let (slug, payload) = split_at(rest, slug_len)?;

        Ok(Self {
            correlation_id: utf8(id, "correlation id")?,
            type_slug: utf8(slug, "type slug")?,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

fn split_at(data: &[u8], n: usize) -> Result<(&[u8], &[u8]), WireError> {
    if data.len() < n {
        return Err(WireError::InsufficientData {
            needed: n,
            have: data.len(),
        });
    }
    Ok(data.split_at(n))
}

fn utf8(data: &[u8], what: &'static str) -> Result<String, WireError> {
    std::str::from_utf8(data)
        .map(str::to_owned)
        .map_err(|_| WireError::InvalidUtf8(what))
}
