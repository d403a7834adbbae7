use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use uuid::Uuid;

use crate::ToolbridgeError;

/// Pull-pagination cursor: the `(updated_at_ms, uid)` pair of the last row
/// returned. The total order over rows is the lexicographic order over this
/// pair, so resuming from a cursor never skips or repeats a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    pub ms: u64,
    pub uid: Uuid,
}

impl Cursor {
    /// The cursor that precedes every row; equivalent to an absent cursor.
    pub fn zero() -> Self {
        Self { ms: 0, uid: Uuid::nil() }
    }

    /// Encode as base64 of `"<ms>:<uid>"`. The URL-safe alphabet keeps the
    /// cursor intact inside query strings.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.ms, self.uid))
    }

    /// Decode a cursor previously produced by [`Cursor::encode`].
    /// Any malformed input is a validation error (HTTP 400 at the edge).
    pub fn decode(s: &str) -> crate::Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| ToolbridgeError::Validation("malformed cursor".to_string()))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| ToolbridgeError::Validation("malformed cursor".to_string()))?;
        let (ms, uid) = text
            .split_once(':')
            .ok_or_else(|| ToolbridgeError::Validation("malformed cursor".to_string()))?;
        let ms = ms
            .parse::<u64>()
            .map_err(|_| ToolbridgeError::Validation("malformed cursor".to_string()))?;
        let uid = Uuid::parse_str(uid)
            .map_err(|_| ToolbridgeError::Validation("malformed cursor".to_string()))?;
        Ok(Self { ms, uid })
    }

    /// Decode an optional query parameter; absent means [`Cursor::zero`].
    pub fn decode_opt(s: Option<&str>) -> crate::Result<Self> {
        match s {
            None | Some("") => Ok(Self::zero()),
            Some(s) => Self::decode(s),
        }
    }

    /// `true` if the row identified by `(ms, uid)` sorts after this cursor.
    pub fn precedes(&self, ms: u64, uid: &Uuid) -> bool {
        (ms, *uid) > (self.ms, self.uid)
    }
}
