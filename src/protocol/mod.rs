//! Wire protocol for image transfers.
//!
//! Two variants share one listening port, chosen at startup:
//!
//! ```text
//! Full mode:
//!   client -> header (256 bytes)
//!   server -> reply  (16 bytes, "0" / "-2" / "-3")
//!   client -> payload (size bytes)
//!   server -> "-2" only if the payload came up short
//!
//! Guide mode:
//!   client -> "<size>\r\n"
//!   client -> payload (size bytes)
//! ```
//!
//! Decoding is pure; the `read_*` helpers do the socket work and never read
//! past the header so the payload stays on the stream.

pub mod frame;
pub mod line;
pub mod reply;

pub use frame::{
    decode_header, encode_header, read_frame, Defaulted, FieldError, Frame, PayloadKind,
    TransferRequest, HEADER_LEN, OVERWRITE_MARKER, SHUTDOWN_SENTINEL,
};
pub use line::{parse_size_line, read_size_line, GuideRequest, MAX_LINE_LEN};
pub use reply::{write_reply, ReplyCode, REPLY_LEN};
