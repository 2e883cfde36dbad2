//! Byte-buffer encodings behind the `Buffer` global.

use base64::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Base64,
    Hex,
}

impl Encoding {
    /// Parses a Node-style encoding name; `None` means utf8.
    pub fn parse(name: Option<&str>) -> anyhow::Result<Self> {
        match name.map(|n| n.to_ascii_lowercase()).as_deref() {
            None | Some("utf8") | Some("utf-8") => Ok(Encoding::Utf8),
            Some("base64") => Ok(Encoding::Base64),
            Some("hex") => Ok(Encoding::Hex),
            Some(other) => Err(anyhow::anyhow!("unknown encoding '{other}'")),
        }
    }
}

/// Decodes `text` in the given encoding into raw bytes.
pub fn decode(text: &str, encoding: Encoding) -> anyhow::Result<Vec<u8>> {
    match encoding {
        Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
        Encoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(text.trim())
            .map_err(|e| anyhow::anyhow!("invalid base64: {e}")),
        Encoding::Hex => hex::decode(text.trim()).map_err(|e| anyhow::anyhow!("invalid hex: {e}")),
    }
}

/// Encodes raw bytes as text in the given encoding.
pub fn encode(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Encoding::Base64 => base64::engine::general_purpose::STANDARD.encode(bytes),
        Encoding::Hex => hex::encode(bytes),
    }
}
