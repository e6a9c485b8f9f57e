//! Guide-mode size announcement: `"<decimal size>\r\n"`, nothing else.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::error::ProtocolError;

/// Longest line accepted before the peer is considered broken.
pub const MAX_LINE_LEN: usize = 64;

/// A guide-mode transfer. The destination is fixed per listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuideRequest {
    pub size: u64,
}

impl GuideRequest {
    pub fn filename(port: u16) -> String {
        format!("test{}.fits", port)
    }
}

/// Parse a size line, terminator included or not. Pure: no I/O.
pub fn parse_size_line(line: &[u8]) -> Result<GuideRequest, ProtocolError> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = String::from_utf8_lossy(line);
    let text = text.trim();

    text.parse()
        .map(|size| GuideRequest { size })
        .map_err(|_| ProtocolError::InvalidSize(text.to_string()))
}

/// Read the size line one byte at a time so no payload byte is consumed.
///
/// The whole line must arrive within `deadline`; a peer that trickles or goes
/// quiet fails with [`ProtocolError::LineStalled`].
pub async fn read_size_line<R: AsyncRead + Unpin>(
    r: &mut R,
    deadline: Duration,
) -> Result<GuideRequest, ProtocolError> {
    timeout(deadline, read_line_bytes(r))
        .await
        .map_err(|_| ProtocolError::LineStalled(deadline))?
}

async fn read_line_bytes<R: AsyncRead + Unpin>(r: &mut R) -> Result<GuideRequest, ProtocolError> {
    let mut line = Vec::with_capacity(16);
    let mut byte = [0u8; 1];

    loop {
        if r.read(&mut byte).await? == 0 {
            return Err(ProtocolError::LineClosed);
        }
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return parse_size_line(&line);
        }
        if line.len() >= MAX_LINE_LEN {
            return Err(ProtocolError::LineTooLong(MAX_LINE_LEN));
        }
    }
}
