//! Fixed-width reply codes sent back to full-mode clients.

use tokio::io::{self, AsyncWrite, AsyncWriteExt};

/// Every reply is exactly this many ASCII bytes.
pub const REPLY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    /// `0` - header accepted, send the payload.
    Accepted,
    /// `-2` - file exists without overwrite, bad filename, or short transfer.
    TransferError,
    /// `-3` - destination folder does not exist.
    DirectoryMissing,
}

impl ReplyCode {
    pub fn code(self) -> i32 {
        match self {
            ReplyCode::Accepted => 0,
            ReplyCode::TransferError => -2,
            ReplyCode::DirectoryMissing => -3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Accepted),
            -2 => Some(Self::TransferError),
            -3 => Some(Self::DirectoryMissing),
            _ => None,
        }
    }

    /// Left-justified decimal code, space padded to [`REPLY_LEN`].
    pub fn encode(self) -> [u8; REPLY_LEN] {
        let mut out = [b' '; REPLY_LEN];
        let digits = self.code().to_string();
        out[..digits.len()].copy_from_slice(digits.as_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        text.trim().parse().ok().and_then(Self::from_code)
    }
}

/// Write a reply and flush it so the client sees it before any payload read.
pub async fn write_reply<W: AsyncWrite + Unpin>(w: &mut W, reply: ReplyCode) -> io::Result<()> {
    w.write_all(&reply.encode()).await?;
    w.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_layout() {
        assert_eq!(&ReplyCode::Accepted.encode(), b"0               ");
        assert_eq!(&ReplyCode::TransferError.encode(), b"-2              ");
        assert_eq!(&ReplyCode::DirectoryMissing.encode(), b"-3              ");
    }

    #[test]
    fn test_decode_reply() {
        assert_eq!(
            ReplyCode::decode(b"-3              "),
            Some(ReplyCode::DirectoryMissing)
        );
        assert_eq!(ReplyCode::decode(b"-1              "), None);
        assert_eq!(ReplyCode::decode(b"garbage"), None);
    }

    #[tokio::test]
    async fn test_write_reply() {
        let mut out = Vec::new();
        write_reply(&mut out, ReplyCode::Accepted).await.unwrap();
        assert_eq!(out.len(), REPLY_LEN);
        assert_eq!(ReplyCode::decode(&out), Some(ReplyCode::Accepted));
    }

    proptest! {
        #[test]
        fn prop_reply_is_always_sixteen_bytes(code in prop_oneof![Just(0i32), Just(-2i32), Just(-3i32)]) {
            let reply = ReplyCode::from_code(code).unwrap();
            let encoded = reply.encode();
            prop_assert_eq!(encoded.len(), REPLY_LEN);
            prop_assert_eq!(ReplyCode::decode(&encoded), Some(reply));
        }
    }
}
