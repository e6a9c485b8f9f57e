//! Hand-off of received images to an external viewer.
//!
//! Sessions only build a [`DisplayDescriptor`]; what happens to it is up to
//! the [`DisplayNotifier`] the server was started with. Notifiers must return
//! immediately, a slow or missing viewer never holds up a transfer.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::DisplaySettings;
use crate::protocol::{PayloadKind, TransferRequest};

/// Raw arrays are always pushed as signed 16-bit pixels.
const BIN_BITPIX: i32 = -16;

/// Everything needed to show one image: run `command args...` with the
/// staging copy on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayDescriptor {
    pub command: String,
    pub args: Vec<String>,
    pub staging_path: PathBuf,
    pub kind: PayloadKind,
}

impl DisplayDescriptor {
    pub fn for_request(
        settings: &DisplaySettings,
        request: &TransferRequest,
        staging_path: PathBuf,
    ) -> Self {
        let target = settings.target.clone();
        let args = match request.kind {
            PayloadKind::Fits => vec![target, "fits".to_string()],
            PayloadKind::Mef => vec![
                target,
                "fits".to_string(),
                "mosaicimage".to_string(),
                "iraf".to_string(),
            ],
            PayloadKind::BinLocked | PayloadKind::BinUnlocked => vec![
                target,
                "array".to_string(),
                format!(
                    "[xdim={},ydim={},bitpix={}]",
                    request.cols, request.rows, BIN_BITPIX
                ),
            ],
        };

        Self {
            command: settings.xpaset.clone(),
            args,
            staging_path,
            kind: request.kind,
        }
    }
}

pub trait DisplayNotifier: Send + Sync {
    /// Must not block. Failures are the notifier's to log.
    fn notify(&self, descriptor: DisplayDescriptor);
}

/// Runs the XPA command on a detached task. Needs a tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct XpaNotifier;

impl XpaNotifier {
    pub fn new() -> Self {
        Self
    }
}

async fn run_viewer(descriptor: &DisplayDescriptor) -> Result<ExitStatus> {
    let stdin = std::fs::File::open(&descriptor.staging_path).with_context(|| {
        format!(
            "Failed to open staging file {}",
            descriptor.staging_path.display()
        )
    })?;

    Command::new(&descriptor.command)
        .args(&descriptor.args)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::null())
        .status()
        .await
        .with_context(|| format!("Failed to spawn {}", descriptor.command))
}

impl DisplayNotifier for XpaNotifier {
    fn notify(&self, descriptor: DisplayDescriptor) {
        tokio::spawn(async move {
            match run_viewer(&descriptor).await {
                Ok(status) if status.success() => {
                    tracing::debug!(
                        command = %descriptor.command,
                        kind = %descriptor.kind,
                        "display command finished"
                    );
                }
                Ok(status) => {
                    tracing::warn!(
                        command = %descriptor.command,
                        %status,
                        "display command failed"
                    );
                }
                Err(e) => {
                    tracing::warn!("display unavailable: {:#}", e);
                }
            }
        });
    }
}

/// Forwards descriptors to a channel, for embedders with their own viewer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<DisplayDescriptor>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DisplayDescriptor>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DisplayNotifier for ChannelNotifier {
    fn notify(&self, descriptor: DisplayDescriptor) {
        if self.tx.send(descriptor).is_err() {
            tracing::debug!("display channel closed, dropping descriptor");
        }
    }
}
