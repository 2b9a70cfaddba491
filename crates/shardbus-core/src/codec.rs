//! Message envelope codec
//!
//! Wire format: one version byte followed by a zlib-compressed JSON object
//! `{"i": id, "c": content, "h": headers, "r": reply_to}`. The version byte
//! lets the envelope evolve without guessing at payload shapes.

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Current envelope version
pub const CODEC_VERSION: u8 = 1;

/// Message headers
pub type Headers = HashMap<String, String>;

#[derive(Serialize, Deserialize)]
struct Envelope {
    i: String,
    c: Value,
    #[serde(default)]
    h: Headers,
    #[serde(default)]
    r: Option<String>,
}

/// A message travelling through streams and pub/sub channels
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Random identifier, also used for per-message locks
    pub id: String,
    /// Payload
    pub content: Value,
    /// Free-form headers (`event` is set for resource events)
    pub headers: Headers,
    /// Channel to publish replies to, if the sender awaits one
    pub reply_to: Option<String>,
    /// Logical channel the message was received on (not encoded)
    pub channel: Option<String>,
    /// Consumer group that received the message (not encoded)
    pub consumer_group: Option<String>,
}

impl Message {
    /// Create an outgoing message with a fresh id
    pub fn new(content: Value) -> Self {
        Self {
            id: generate_id(),
            content,
            headers: Headers::new(),
            reply_to: None,
            channel: None,
            consumer_group: None,
        }
    }

    /// Set headers
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Add one header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the reply channel
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Encode to the wire format
    pub fn pack(&self) -> Result<Vec<u8>> {
        let envelope = Envelope {
            i: self.id.clone(),
            c: self.content.clone(),
            h: self.headers.clone(),
            r: self.reply_to.clone(),
        };
        let json = serde_json::to_vec(&envelope)
            .map_err(|e| Error::Codec(format!("Failed to serialize envelope: {}", e)))?;

        let mut out = vec![CODEC_VERSION];
        let mut encoder = ZlibEncoder::new(&mut out, Compression::default());
        encoder
            .write_all(&json)
            .map_err(|e| Error::Codec(format!("Failed to compress envelope: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| Error::Codec(format!("Failed to compress envelope: {}", e)))?;
        Ok(out)
    }

    /// Decode from the wire format, tagging the message with where it came from
    pub fn unpack(
        data: &[u8],
        channel: Option<&str>,
        consumer_group: Option<&str>,
    ) -> Result<Self> {
        let (version, body) = data
            .split_first()
            .ok_or_else(|| Error::Codec("empty payload".to_string()))?;
        if *version != CODEC_VERSION {
            return Err(Error::Codec(format!(
                "unsupported envelope version {}",
                version
            )));
        }

        let mut json = Vec::new();
        ZlibDecoder::new(body)
            .read_to_end(&mut json)
            .map_err(|e| Error::Codec(format!("Failed to decompress envelope: {}", e)))?;
        let envelope: Envelope = serde_json::from_slice(&json)
            .map_err(|e| Error::Codec(format!("Failed to deserialize envelope: {}", e)))?;

        Ok(Self {
            id: envelope.i,
            content: envelope.c,
            headers: envelope.h,
            reply_to: envelope.r,
            channel: channel.map(str::to_string),
            consumer_group: consumer_group.map(str::to_string),
        })
    }
}

/// Random base-36 id of up to 49 bits
fn generate_id() -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n: u64 = rand::thread_rng().gen_range(0..(2u64 << 48));
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pack_unpack_preserves_fields() {
        let mut headers = Headers::new();
        headers.insert("event".to_string(), "created".to_string());
        let message = Message::new(json!({ "a": 1, "tags": ["x", "y"] }))
            .with_headers(headers)
            .with_reply_to("REPLY_TO:abc");

        let packed = message.pack().unwrap();
        assert_eq!(packed[0], CODEC_VERSION);

        let unpacked = Message::unpack(&packed, Some("orders"), Some("billing")).unwrap();
        assert_eq!(unpacked.id, message.id);
        assert_eq!(unpacked.content, json!({ "a": 1, "tags": ["x", "y"] }));
        assert_eq!(unpacked.header("event"), Some("created"));
        assert_eq!(unpacked.reply_to.as_deref(), Some("REPLY_TO:abc"));
        assert_eq!(unpacked.channel.as_deref(), Some("orders"));
        assert_eq!(unpacked.consumer_group.as_deref(), Some("billing"));
    }

    #[test]
    fn test_unpack_rejects_unknown_version() {
        let mut packed = Message::new(json!(null)).pack().unwrap();
        packed[0] = 9;
        let err = Message::unpack(&packed, None, None).unwrap_err();
        assert!(err.to_string().contains("unsupported envelope version 9"));
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        assert!(Message::unpack(&[], None, None).is_err());
        assert!(Message::unpack(&[CODEC_VERSION, 1, 2, 3], None, None).is_err());
    }

    #[test]
    fn test_generated_ids_are_base36() {
        for _ in 0..100 {
            let id = generate_id();
            assert!(!id.is_empty());
            assert!(id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        }
    }
}
