//! Full-mode transfer header.
//!
//! Wire format: a fixed 256-byte ASCII header, no length prefix.
//!
//! ```text
//! [0..16)   file size, zero- or space-padded decimal
//! [16]      separator, ignored
//! [17..)    "<filename> <kind> <cols> <rows> <display>" terminated by NUL
//! ```
//!
//! A header starting with `-1` asks the server to stop this client's work.

use bytes::BytesMut;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;

pub const HEADER_LEN: usize = 256;

/// Bytes `[0, SIZE_FIELD_LEN)` carry the payload size.
const SIZE_FIELD_LEN: usize = 16;

/// Start of the space separated field string.
const FIELDS_OFFSET: usize = 17;

pub const SHUTDOWN_SENTINEL: &[u8] = b"-1";

pub const OVERWRITE_MARKER: char = '!';

pub const DEFAULT_KIND: PayloadKind = PayloadKind::Mef;
pub const DEFAULT_COLS: u32 = 512;
pub const DEFAULT_ROWS: u32 = 512;

// =============================================================================
// Payload kind
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    Fits = 0,
    Mef = 1,
    /// Raw array; an `.OK` lock file marks the write as complete.
    BinLocked = 2,
    BinUnlocked = 3,
}

impl PayloadKind {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Fits),
            1 => Some(Self::Mef),
            2 => Some(Self::BinLocked),
            3 => Some(Self::BinUnlocked),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_binary(self) -> bool {
        matches!(self, Self::BinLocked | Self::BinUnlocked)
    }

    pub fn writes_lock_file(self) -> bool {
        self == Self::BinLocked
    }

    /// Extension used for the display staging copy.
    pub fn staging_extension(self) -> &'static str {
        if self.is_binary() {
            "bin"
        } else {
            "fits"
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadKind::Fits => "FITS",
            PayloadKind::Mef => "MEF",
            PayloadKind::BinLocked => "BIN (locked)",
            PayloadKind::BinUnlocked => "BIN",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Field tokenizer
// =============================================================================

/// Why an optional header field could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    Missing,
    NotANumber(String),
    UnknownKind(i64),
}

/// Records that the optional fields fell back to defaults, and which field
/// caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaulted {
    pub field: &'static str,
    pub error: FieldError,
}

impl fmt::Display for Defaulted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            FieldError::Missing => write!(f, "{} missing", self.field),
            FieldError::NotANumber(raw) => write!(f, "{} not a number: {:?}", self.field, raw),
            FieldError::UnknownKind(code) => write!(f, "{} unknown code {}", self.field, code),
        }
    }
}

fn numeric_field<T: std::str::FromStr>(
    tokens: &[&str],
    index: usize,
    field: &'static str,
) -> Result<T, Defaulted> {
    let raw = tokens.get(index).ok_or(Defaulted {
        field,
        error: FieldError::Missing,
    })?;
    raw.trim().parse().map_err(|_| Defaulted {
        field,
        error: FieldError::NotANumber(raw.to_string()),
    })
}

struct OptionalFields {
    kind: PayloadKind,
    cols: u32,
    rows: u32,
    display: bool,
}

impl Default for OptionalFields {
    fn default() -> Self {
        Self {
            kind: DEFAULT_KIND,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            display: false,
        }
    }
}

/// The four numeric fields are all-or-nothing: one bad token defaults them all.
fn parse_optional_fields(tokens: &[&str]) -> Result<OptionalFields, Defaulted> {
    let code: i64 = numeric_field(tokens, 1, "kind")?;
    let kind = PayloadKind::from_code(code).ok_or(Defaulted {
        field: "kind",
        error: FieldError::UnknownKind(code),
    })?;
    let cols = numeric_field(tokens, 2, "cols")?;
    let rows = numeric_field(tokens, 3, "rows")?;
    let display: i64 = numeric_field(tokens, 4, "display")?;

    Ok(OptionalFields {
        kind,
        cols,
        rows,
        display: display == 1,
    })
}

// =============================================================================
// Transfer request
// =============================================================================

/// A parsed full-mode header. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub size: u64,
    /// Destination as sent by the client, overwrite marker removed.
    pub filename: String,
    pub overwrite: bool,
    pub kind: PayloadKind,
    /// Array width, only meaningful for binary payloads.
    pub cols: u32,
    /// Array height, only meaningful for binary payloads.
    pub rows: u32,
    pub display: bool,
    /// Set when the optional fields were replaced by defaults.
    pub defaulted: Option<Defaulted>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Shutdown,
    Request(TransferRequest),
}

fn trim_field(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_matches(|c: char| c.is_ascii_whitespace() || c == '\0')
        .to_string()
}

/// Decode a complete header. Pure: no I/O.
pub fn decode_header(raw: &[u8]) -> Result<Frame, ProtocolError> {
    let cleaned: Vec<u8> = raw.iter().copied().filter(|b| *b != b'"').collect();

    if cleaned.starts_with(SHUTDOWN_SENTINEL) {
        return Ok(Frame::Shutdown);
    }

    let size_text = trim_field(&cleaned[..cleaned.len().min(SIZE_FIELD_LEN)]);
    let size = size_text
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidSize(size_text.clone()))?;

    let fields = cleaned.get(FIELDS_OFFSET..).unwrap_or_default();
    let fields = match fields.iter().position(|b| *b == 0) {
        Some(end) => &fields[..end],
        None => fields,
    };
    let fields = String::from_utf8_lossy(fields);
    let tokens: Vec<&str> = fields.split(' ').collect();

    let raw_name = tokens.first().copied().unwrap_or_default();
    let overwrite = raw_name.starts_with(OVERWRITE_MARKER);
    let filename = raw_name.trim_start_matches(OVERWRITE_MARKER).to_string();
    if filename.is_empty() {
        return Err(ProtocolError::MissingFilename);
    }

    let (optional, defaulted) = match parse_optional_fields(&tokens) {
        Ok(optional) => (optional, None),
        Err(defaulted) => (OptionalFields::default(), Some(defaulted)),
    };

    Ok(Frame::Request(TransferRequest {
        size,
        filename,
        overwrite,
        kind: optional.kind,
        cols: optional.cols,
        rows: optional.rows,
        display: optional.display,
        defaulted,
    }))
}

/// Encode a header the way a client would send it.
pub fn encode_header(request: &TransferRequest) -> [u8; HEADER_LEN] {
    let marker = if request.overwrite { "!" } else { "" };
    let text = format!(
        "{:<16} {}{} {} {} {} {}",
        request.size,
        marker,
        request.filename,
        request.kind.code(),
        request.cols,
        request.rows,
        u8::from(request.display),
    );
    let mut out = [0u8; HEADER_LEN];
    let len = text.len().min(HEADER_LEN - 1);
    out[..len].copy_from_slice(&text.as_bytes()[..len]);
    out
}

/// Read one header from the stream, never consuming payload bytes.
///
/// A short read that still starts with the sentinel counts as shutdown.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, ProtocolError> {
    let mut buf = BytesMut::zeroed(HEADER_LEN);
    let mut filled = 0;

    while filled < HEADER_LEN {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled < HEADER_LEN {
        if buf[..filled].starts_with(SHUTDOWN_SENTINEL) {
            return Ok(Frame::Shutdown);
        }
        return Err(ProtocolError::FrameIncomplete {
            received: filled,
            expected: HEADER_LEN,
        });
    }

    decode_header(&buf)
}

// =============================================================================
// Tests
// =============================================================================
