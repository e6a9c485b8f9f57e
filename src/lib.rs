//! Remote image server.
//!
//! Listens for camera controllers sending finished exposures over TCP,
//! writes each payload to disk, and optionally pushes it to an image viewer.
//!
//! ```text
//! ConnectionServer --accept--> TransferSession --decode--> protocol::{frame, line}
//!                                     |
//!                                     +--> destination file (+ .OK lock file)
//!                                     +--> DisplayNotifier (optional)
//! ```

pub mod cli;
pub mod config;
pub mod console;
pub mod display;
pub mod error;
pub mod protocol;
pub mod server;

pub use config::{SentinelScope, Settings};
pub use display::{ChannelNotifier, DisplayDescriptor, DisplayNotifier, XpaNotifier};
pub use error::{ConfigError, ProtocolError, SessionError};
pub use server::{
    ConnectionServer, SessionContext, SessionEnd, SessionState, TransferOutcome, TransferSession,
};
