//! One connection, one image.
//!
//! ```text
//! AwaitingHeader -> Validating -> AwaitingReply -> ReceivingPayload -> Finalizing -> Closed
//!        \______________\______________\_______________\________________\-> Errored
//! ```
//!
//! Guide mode skips `AwaitingReply` and never writes to the socket.
//! A server stop reaches a session only while it waits for its header.

use bytes::BytesMut;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::console::Announcer;
use crate::display::{DisplayDescriptor, DisplayNotifier};
use crate::error::{Result, SessionError};
use crate::protocol::{
    read_frame, read_size_line, write_reply, Frame, GuideRequest, ReplyCode, TransferRequest,
};
use crate::server::locks::PathLocks;

/// Extension of the zero-length marker written next to locked BIN images.
pub const LOCK_EXTENSION: &str = "OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    AwaitingHeader,
    Validating,
    AwaitingReply,
    ReceivingPayload,
    Finalizing,
    Closed,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

/// Shared, read-only inputs for every session on one server.
pub struct SessionContext {
    pub settings: Arc<Settings>,
    /// Port the server is bound to; names the guide-mode file.
    pub port: u16,
    pub notifier: Option<Arc<dyn DisplayNotifier>>,
    pub locks: Option<PathLocks>,
    pub announcer: Announcer,
    /// Server stop token. Sessions still waiting for a header give up on it.
    pub shutdown: CancellationToken,
}

impl SessionContext {
    pub fn new(settings: Arc<Settings>, port: u16) -> Self {
        let announcer = Announcer::new(settings.verbose, settings.beep);
        let locks = settings.lock_destinations.then(PathLocks::new);
        Self {
            settings,
            port,
            notifier: None,
            locks,
            announcer,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn DisplayNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// What a finished payload phase produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub expected: u64,
    pub bytes_received: u64,
    pub complete: bool,
    pub lock_file: Option<PathBuf>,
    pub display: Option<DisplayDescriptor>,
}

impl TransferOutcome {
    fn new(path: PathBuf, expected: u64, bytes_received: u64) -> Self {
        Self {
            path,
            expected,
            bytes_received,
            complete: bytes_received == expected,
            lock_file: None,
            display: None,
        }
    }

    pub fn ensure_complete(&self) -> Result<()> {
        if self.complete {
            return Ok(());
        }
        Err(SessionError::TransferIncomplete {
            path: self.path.clone(),
            received: self.bytes_received,
            expected: self.expected,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client sent the `-1` header.
    Shutdown,
    /// The server stopped before this client sent a header.
    Abandoned,
    Transferred(TransferOutcome),
}

/// `foo.bin` -> `foo.OK`; anything else gets `.OK` appended.
pub fn lock_file_path(path: &Path) -> PathBuf {
    let is_bin = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("bin"));
    if is_bin {
        path.with_extension(LOCK_EXTENSION)
    } else {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(LOCK_EXTENSION);
        PathBuf::from(name)
    }
}

async fn exists(path: &Path) -> Result<bool> {
    fs::try_exists(path)
        .await
        .map_err(|e| SessionError::filesystem(path, e))
}

/// Check the destination before accepting: refuse to clobber without the
/// overwrite marker, require the parent folder, then clear the old file.
async fn prepare_destination(path: &Path, overwrite: bool) -> Result<()> {
    let existing = exists(path).await?;
    if existing && !overwrite {
        return Err(SessionError::FilesystemConflict {
            path: path.to_path_buf(),
        });
    }

    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !exists(dir).await? {
            return Err(SessionError::DestinationMissing {
                dir: dir.to_path_buf(),
            });
        }
    }

    if existing {
        fs::remove_file(path)
            .await
            .map_err(|e| SessionError::filesystem(path, e))?;
    }
    Ok(())
}

pub struct TransferSession<S> {
    stream: S,
    ctx: Arc<SessionContext>,
    peer: String,
    state: SessionState,
}

impl<S> TransferSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, ctx: Arc<SessionContext>, peer: impl Into<String>) -> Self {
        Self {
            stream,
            ctx,
            peer: peer.into(),
            state: SessionState::AwaitingHeader,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            !self.state.is_terminal(),
            "session already {:?}",
            self.state
        );
        debug_assert!(
            next == SessionState::Errored || next > self.state,
            "backwards transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(peer = %self.peer, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Drive the connection to a terminal state. Runs exactly once.
    pub async fn run(&mut self) -> Result<SessionEnd> {
        let result = if self.ctx.settings.guide_mode {
            self.run_guide().await
        } else {
            self.run_full().await
        };

        match &result {
            Ok(_) => self.advance(SessionState::Closed),
            Err(_) => self.advance(SessionState::Errored),
        }
        result
    }

    async fn run_full(&mut self) -> Result<SessionEnd> {
        let result = self.full_transfer().await;
        if let Err(e) = &result {
            if let Some(code) = e.reply_code() {
                self.reply_best_effort(code).await;
            }
        }
        result
    }

    async fn full_transfer(&mut self) -> Result<SessionEnd> {
        let shutdown = self.ctx.shutdown.clone();
        let frame = tokio::select! {
            frame = read_frame(&mut self.stream) => Some(frame?),
            _ = shutdown.cancelled() => None,
        };
        let Some(frame) = frame else {
            return Ok(self.abandon());
        };
        let request = match frame {
            Frame::Shutdown => {
                tracing::info!(peer = %self.peer, "shutdown header received");
                return Ok(SessionEnd::Shutdown);
            }
            Frame::Request(request) => request,
        };
        if let Some(defaulted) = &request.defaulted {
            tracing::debug!(
                peer = %self.peer,
                filename = %request.filename,
                "optional header fields defaulted ({})",
                defaulted
            );
        }

        self.advance(SessionState::Validating);
        let path = self.ctx.settings.resolve(&request.filename);
        self.ctx
            .announcer
            .receiving(&path, request.size, Some(request.overwrite));
        let _guard = self.lock_destination(&path).await;
        prepare_destination(&path, request.overwrite).await?;

        self.advance(SessionState::AwaitingReply);
        write_reply(&mut self.stream, ReplyCode::Accepted)
            .await
            .map_err(SessionError::Transport)?;

        self.advance(SessionState::ReceivingPayload);
        let received = self.receive_payload(&path, request.size).await?;

        self.advance(SessionState::Finalizing);
        let mut outcome = TransferOutcome::new(path, request.size, received);
        if !outcome.complete {
            self.reply_best_effort(ReplyCode::TransferError).await;
            return Ok(SessionEnd::Transferred(outcome));
        }

        if request.kind.writes_lock_file() {
            let lock = lock_file_path(&outcome.path);
            fs::File::create(&lock)
                .await
                .map_err(|e| SessionError::filesystem(&lock, e))?;
            outcome.lock_file = Some(lock);
        }

        if request.display {
            outcome.display = self.stage_display(&request, &outcome.path).await;
        }

        Ok(SessionEnd::Transferred(outcome))
    }

    async fn run_guide(&mut self) -> Result<SessionEnd> {
        let shutdown = self.ctx.shutdown.clone();
        let deadline = self.ctx.settings.line_timeout();
        let line = tokio::select! {
            line = read_size_line(&mut self.stream, deadline) => Some(line?),
            _ = shutdown.cancelled() => None,
        };
        let Some(GuideRequest { size }) = line else {
            return Ok(self.abandon());
        };

        self.advance(SessionState::Validating);
        let path = self
            .ctx
            .settings
            .resolve(&GuideRequest::filename(self.ctx.port));
        self.ctx.announcer.receiving(&path, size, None);
        let _guard = self.lock_destination(&path).await;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(SessionError::filesystem(&path, e)),
        }

        self.advance(SessionState::ReceivingPayload);
        let received = self.receive_payload(&path, size).await?;

        self.advance(SessionState::Finalizing);
        Ok(SessionEnd::Transferred(TransferOutcome::new(
            path, size, received,
        )))
    }

    fn abandon(&self) -> SessionEnd {
        tracing::debug!(peer = %self.peer, "server stopping, dropping idle connection");
        SessionEnd::Abandoned
    }

    async fn lock_destination(&self, path: &Path) -> Option<OwnedMutexGuard<()>> {
        match &self.ctx.locks {
            Some(locks) => Some(locks.acquire(path).await),
            None => None,
        }
    }

    /// Copy exactly `size` bytes from the socket into `path`, stopping early
    /// only if the peer closes. Returns the number of bytes written.
    async fn receive_payload(&mut self, path: &Path, size: u64) -> Result<u64> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| SessionError::filesystem(path, e))?;

        let chunk = size.min(self.ctx.settings.max_chunk_bytes as u64) as usize;
        let mut buf = BytesMut::zeroed(chunk);
        let mut received = 0u64;

        while received < size {
            let want = (size - received).min(chunk as u64) as usize;
            let n = self
                .stream
                .read(&mut buf[..want])
                .await
                .map_err(SessionError::Transport)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .await
                .map_err(|e| SessionError::filesystem(path, e))?;
            received += n as u64;
        }

        file.flush()
            .await
            .map_err(|e| SessionError::filesystem(path, e))?;
        file.sync_all()
            .await
            .map_err(|e| SessionError::filesystem(path, e))?;

        if received < size {
            tracing::warn!(
                peer = %self.peer,
                path = %path.display(),
                "ERROR reading image. Received {} of {} bytes",
                received,
                size
            );
        }
        Ok(received)
    }

    /// Copy the image aside so the viewer never holds the real file open,
    /// then hand the descriptor to the notifier.
    async fn stage_display(
        &self,
        request: &TransferRequest,
        path: &Path,
    ) -> Option<DisplayDescriptor> {
        let settings = &self.ctx.settings;
        if !settings.display.enabled {
            return None;
        }
        let notifier = self.ctx.notifier.as_ref()?;

        let staging = settings.staging_path(request.kind.staging_extension());
        if let Err(e) = fs::copy(path, &staging).await {
            tracing::warn!(
                staging = %staging.display(),
                "failed to stage image for display: {}",
                e
            );
            return None;
        }

        let descriptor = DisplayDescriptor::for_request(&settings.display, request, staging);
        notifier.notify(descriptor.clone());
        Some(descriptor)
    }

    async fn reply_best_effort(&mut self, code: ReplyCode) {
        if let Err(e) = write_reply(&mut self.stream, code).await {
            tracing::debug!(peer = %self.peer, ?code, "reply not delivered: {}", e);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::ChannelNotifier;
    use crate::error::ProtocolError;
    use crate::protocol::{PayloadKind, HEADER_LEN, REPLY_LEN};
    use std::fs as stdfs;
    use tempfile::TempDir;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    type Finished = (Result<SessionEnd>, SessionState);

    fn settings(root: &Path) -> Settings {
        Settings {
            root: root.to_path_buf(),
            ..Settings::default()
        }
    }

    fn spawn_session(ctx: SessionContext) -> (DuplexStream, JoinHandle<Finished>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let ctx = Arc::new(ctx);
        let handle = tokio::spawn(async move {
            let mut session = TransferSession::new(server, ctx, "test-peer");
            let result = session.run().await;
            (result, session.state())
        });
        (client, handle)
    }

    fn header(text: &str) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..text.len()].copy_from_slice(text.as_bytes());
        out
    }

    async fn send_header(client: &mut DuplexStream, size: u64, fields: &str) {
        let text = format!("{:016} {}", size, fields);
        client.write_all(&header(&text)).await.unwrap();
    }

    async fn read_reply(client: &mut DuplexStream) -> ReplyCode {
        let mut buf = [0u8; REPLY_LEN];
        client.read_exact(&mut buf).await.unwrap();
        ReplyCode::decode(&buf).unwrap()
    }

    fn transferred(result: Result<SessionEnd>) -> TransferOutcome {
        match result.unwrap() {
            SessionEnd::Transferred(outcome) => outcome,
            other => panic!("Expected a transfer, got {:?}", other),
        }
    }

    #[test]
    fn test_lock_file_path() {
        assert_eq!(lock_file_path(Path::new("foo.bin")), PathBuf::from("foo.OK"));
        assert_eq!(
            lock_file_path(Path::new("/d/foo.BIN")),
            PathBuf::from("/d/foo.OK")
        );
        assert_eq!(
            lock_file_path(Path::new("foo.dat")),
            PathBuf::from("foo.dat.OK")
        );
    }

    #[test]
    fn test_states_only_move_forward() {
        use SessionState::*;
        let order = [
            AwaitingHeader,
            Validating,
            AwaitingReply,
            ReceivingPayload,
            Finalizing,
            Closed,
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        assert!(Closed.is_terminal() && Errored.is_terminal());
        assert!(!Finalizing.is_terminal());
    }

    #[tokio::test]
    async fn test_locked_bin_scenario() {
        let tmp = TempDir::new().unwrap();
        let (mut client, handle) = spawn_session(SessionContext::new(
            Arc::new(settings(tmp.path())),
            6543,
        ));

        send_header(&mut client, 1024, "!img.bin 2 512 512 0").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::Accepted);
        client.write_all(&[7u8; 1024]).await.unwrap();

        let (result, state) = handle.await.unwrap();
        let outcome = transferred(result);
        assert!(outcome.complete);
        assert_eq!(outcome.bytes_received, 1024);
        assert_eq!(outcome.display, None);
        assert_eq!(outcome.lock_file, Some(tmp.path().join("img.OK")));
        assert_eq!(state, SessionState::Closed);

        assert_eq!(stdfs::read(tmp.path().join("img.bin")).unwrap(), vec![7u8; 1024]);
        assert_eq!(stdfs::metadata(tmp.path().join("img.OK")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_unlocked_bin_has_no_lock_file() {
        let tmp = TempDir::new().unwrap();
        let (mut client, handle) = spawn_session(SessionContext::new(
            Arc::new(settings(tmp.path())),
            6543,
        ));

        send_header(&mut client, 16, "foo.bin 3 4 2 0").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::Accepted);
        client.write_all(&[1u8; 16]).await.unwrap();

        let outcome = transferred(handle.await.unwrap().0);
        assert!(outcome.complete);
        assert_eq!(outcome.lock_file, None);
        assert!(!tmp.path().join("foo.OK").exists());
    }

    #[tokio::test]
    async fn test_peer_close_marks_incomplete() {
        let tmp = TempDir::new().unwrap();
        let (mut client, handle) = spawn_session(SessionContext::new(
            Arc::new(settings(tmp.path())),
            6543,
        ));

        send_header(&mut client, 100, "short.bin 2 10 10 0").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::Accepted);
        client.write_all(&[9u8; 99]).await.unwrap();
        drop(client);

        let (result, state) = handle.await.unwrap();
        let outcome = transferred(result);
        assert!(!outcome.complete);
        assert_eq!(outcome.bytes_received, 99);
        assert_eq!(outcome.lock_file, None);
        assert!(matches!(
            outcome.ensure_complete(),
            Err(SessionError::TransferIncomplete {
                received: 99,
                expected: 100,
                ..
            })
        ));
        assert_eq!(state, SessionState::Closed);

        assert_eq!(stdfs::metadata(tmp.path().join("short.bin")).unwrap().len(), 99);
        assert!(!tmp.path().join("short.OK").exists());
    }

    #[tokio::test]
    async fn test_incomplete_transfer_replies_error() {
        let tmp = TempDir::new().unwrap();
        let (mut client, handle) = spawn_session(SessionContext::new(
            Arc::new(settings(tmp.path())),
            6543,
        ));

        send_header(&mut client, 10, "half.fits 0 1 1 0").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::Accepted);
        client.write_all(&[0u8; 5]).await.unwrap();
        client.shutdown().await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(ReplyCode::decode(&rest), Some(ReplyCode::TransferError));
        assert!(!transferred(handle.await.unwrap().0).complete);
    }

    #[tokio::test]
    async fn test_never_reads_past_size() {
        let tmp = TempDir::new().unwrap();
        let (mut client, handle) = spawn_session(SessionContext::new(
            Arc::new(settings(tmp.path())),
            6543,
        ));

        send_header(&mut client, 8, "exact.fits 0 1 1 0").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::Accepted);
        client.write_all(b"12345678EXTRA").await.unwrap();

        let outcome = transferred(handle.await.unwrap().0);
        assert!(outcome.complete);
        assert_eq!(stdfs::read(tmp.path().join("exact.fits")).unwrap(), b"12345678");
    }

    #[tokio::test]
    async fn test_small_chunks_still_complete() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings {
            max_chunk_bytes: 3,
            ..settings(tmp.path())
        };
        let (mut client, handle) = spawn_session(SessionContext::new(Arc::new(settings), 6543));

        send_header(&mut client, 10, "chunks.fits 0 1 1 0").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::Accepted);
        client.write_all(b"0123456789").await.unwrap();

        assert!(transferred(handle.await.unwrap().0).complete);
        assert_eq!(stdfs::read(tmp.path().join("chunks.fits")).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_zero_length_transfer() {
        let tmp = TempDir::new().unwrap();
        let (mut client, handle) = spawn_session(SessionContext::new(
            Arc::new(settings(tmp.path())),
            6543,
        ));

        send_header(&mut client, 0, "empty.fits 0 1 1 0").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::Accepted);

        assert!(transferred(handle.await.unwrap().0).complete);
        assert_eq!(stdfs::metadata(tmp.path().join("empty.fits")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_existing_file_without_overwrite() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("keep.fits");
        stdfs::write(&target, "original").unwrap();
        let (mut client, handle) = spawn_session(SessionContext::new(
            Arc::new(settings(tmp.path())),
            6543,
        ));

        send_header(&mut client, 4, "keep.fits 0 1 1 0").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::TransferError);

        let (result, state) = handle.await.unwrap();
        assert!(matches!(result, Err(SessionError::FilesystemConflict { .. })));
        assert_eq!(state, SessionState::Errored);
        assert_eq!(stdfs::read_to_string(&target).unwrap(), "original");
    }

    #[tokio::test]
    async fn test_existing_file_with_overwrite() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("swap.fits");
        stdfs::write(&target, "original contents").unwrap();
        let (mut client, handle) = spawn_session(SessionContext::new(
            Arc::new(settings(tmp.path())),
            6543,
        ));

        send_header(&mut client, 3, "!swap.fits 0 1 1 0").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::Accepted);
        client.write_all(b"new").await.unwrap();

        assert!(transferred(handle.await.unwrap().0).complete);
        assert_eq!(stdfs::read_to_string(&target).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let (mut client, handle) = spawn_session(SessionContext::new(
            Arc::new(settings(tmp.path())),
            6543,
        ));

        send_header(&mut client, 4, "nowhere/img.fits 0 1 1 0").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::DirectoryMissing);

        let (result, state) = handle.await.unwrap();
        assert!(matches!(result, Err(SessionError::DestinationMissing { dir }) if dir == tmp.path().join("nowhere")));
        assert_eq!(state, SessionState::Errored);
        assert!(!tmp.path().join("nowhere").exists());
    }

    #[tokio::test]
    async fn test_shutdown_sentinel_sends_nothing() {
        let tmp = TempDir::new().unwrap();
        let (mut client, handle) = spawn_session(SessionContext::new(
            Arc::new(settings(tmp.path())),
            6543,
        ));

        client.write_all(&header("-1")).await.unwrap();
        client.write_all(b"not a payload").await.unwrap();

        let (result, state) = handle.await.unwrap();
        assert_eq!(result.unwrap(), SessionEnd::Shutdown);
        assert_eq!(state, SessionState::Closed);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "no reply expected, got {:?}", rest);
        assert_eq!(stdfs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_truncated_header_gets_no_reply() {
        let tmp = TempDir::new().unwrap();
        let (mut client, handle) = spawn_session(SessionContext::new(
            Arc::new(settings(tmp.path())),
            6543,
        ));

        client.write_all(b"0000000000000010 x.fits").await.unwrap();
        client.shutdown().await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let (result, state) = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::FrameIncomplete { .. }))
        ));
        assert_eq!(state, SessionState::Errored);
    }

    #[tokio::test]
    async fn test_missing_filename_rejected() {
        let tmp = TempDir::new().unwrap();
        let (mut client, handle) = spawn_session(SessionContext::new(
            Arc::new(settings(tmp.path())),
            6543,
        ));

        send_header(&mut client, 4, "").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::TransferError);
        assert!(handle.await.unwrap().0.is_err());
    }

    #[tokio::test]
    async fn test_display_stages_copy_and_notifies() {
        let tmp = TempDir::new().unwrap();
        let (notifier, mut rx) = ChannelNotifier::new();
        let ctx = SessionContext::new(Arc::new(settings(tmp.path())), 6543)
            .with_notifier(Arc::new(notifier));
        let (mut client, handle) = spawn_session(ctx);

        send_header(&mut client, 6, "raw.bin 3 3 1 1").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::Accepted);
        client.write_all(b"pixels").await.unwrap();

        let outcome = transferred(handle.await.unwrap().0);
        let staging = tmp.path().join("temp_display_file.bin");
        let descriptor = outcome.display.unwrap();
        assert_eq!(descriptor.staging_path, staging);
        assert_eq!(descriptor.kind, PayloadKind::BinUnlocked);
        assert!(descriptor
            .args
            .contains(&"[xdim=3,ydim=1,bitpix=-16]".to_string()));
        assert_eq!(stdfs::read(&staging).unwrap(), b"pixels");
        assert_eq!(rx.recv().await, Some(descriptor));
    }

    #[tokio::test]
    async fn test_display_skipped_when_disabled() {
        let tmp = TempDir::new().unwrap();
        let mut settings = settings(tmp.path());
        settings.display.enabled = false;
        let (notifier, mut rx) = ChannelNotifier::new();
        let ctx = SessionContext::new(Arc::new(settings), 6543).with_notifier(Arc::new(notifier));
        let (mut client, handle) = spawn_session(ctx);

        send_header(&mut client, 2, "a.fits 0 1 1 1").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::Accepted);
        client.write_all(b"ok").await.unwrap();

        let outcome = transferred(handle.await.unwrap().0);
        assert_eq!(outcome.display, None);
        assert!(rx.try_recv().is_err());
        assert!(!tmp.path().join("temp_display_file.fits").exists());
    }

    #[tokio::test]
    async fn test_guide_mode_scenario() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings {
            guide_mode: true,
            ..settings(tmp.path())
        };
        let (mut client, handle) = spawn_session(SessionContext::new(Arc::new(settings), 6543));

        client.write_all(b"2048\r\n").await.unwrap();
        client.write_all(&[3u8; 2048]).await.unwrap();

        let (result, state) = handle.await.unwrap();
        let outcome = transferred(result);
        assert!(outcome.complete);
        assert_eq!(outcome.path, tmp.path().join("test6543.fits"));
        assert_eq!(state, SessionState::Closed);
        assert_eq!(
            stdfs::metadata(tmp.path().join("test6543.fits")).unwrap().len(),
            2048
        );

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "guide mode never replies");
    }

    #[tokio::test]
    async fn test_guide_mode_replaces_previous_image() {
        let tmp = TempDir::new().unwrap();
        stdfs::write(tmp.path().join("test7000.fits"), vec![0u8; 4096]).unwrap();
        let settings = Settings {
            guide_mode: true,
            ..settings(tmp.path())
        };
        let (mut client, handle) = spawn_session(SessionContext::new(Arc::new(settings), 7000));

        client.write_all(b"4\r\nabcd").await.unwrap();

        assert!(transferred(handle.await.unwrap().0).complete);
        assert_eq!(stdfs::read(tmp.path().join("test7000.fits")).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_guide_mode_bad_line() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings {
            guide_mode: true,
            ..settings(tmp.path())
        };
        let (mut client, handle) = spawn_session(SessionContext::new(Arc::new(settings), 6543));

        client.write_all(b"lots\r\n").await.unwrap();

        let (result, state) = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::InvalidSize(_)))
        ));
        assert_eq!(state, SessionState::Errored);
        assert!(!tmp.path().join("test6543.fits").exists());
    }

    #[tokio::test]
    async fn test_guide_mode_short_payload_keeps_partial_file() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings {
            guide_mode: true,
            ..settings(tmp.path())
        };
        let (mut client, handle) = spawn_session(SessionContext::new(Arc::new(settings), 6543));

        client.write_all(b"100\r\n").await.unwrap();
        client.write_all(&[8u8; 40]).await.unwrap();
        client.shutdown().await.unwrap();

        let (result, state) = handle.await.unwrap();
        let outcome = transferred(result);
        assert!(!outcome.complete);
        assert_eq!(outcome.bytes_received, 40);
        assert_eq!(outcome.expected, 100);
        assert_eq!(outcome.lock_file, None);
        assert_eq!(state, SessionState::Closed);
        assert_eq!(
            stdfs::metadata(tmp.path().join("test6543.fits")).unwrap().len(),
            40
        );

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "guide mode never replies, even when short");
    }

    #[tokio::test]
    async fn test_stop_drops_session_waiting_for_header() {
        let tmp = TempDir::new().unwrap();
        let shutdown = CancellationToken::new();
        let ctx = SessionContext::new(Arc::new(settings(tmp.path())), 6543)
            .with_shutdown(shutdown.clone());
        let (mut client, handle) = spawn_session(ctx);

        client.write_all(b"0000000000000010").await.unwrap();
        shutdown.cancel();

        let (result, state) = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("session ignored the stop")
            .unwrap();
        assert_eq!(result.unwrap(), SessionEnd::Abandoned);
        assert_eq!(state, SessionState::Closed);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "no reply for an abandoned header");
    }

    #[tokio::test]
    async fn test_stop_drops_guide_session_waiting_for_line() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings {
            guide_mode: true,
            ..settings(tmp.path())
        };
        let shutdown = CancellationToken::new();
        let ctx = SessionContext::new(Arc::new(settings), 6543).with_shutdown(shutdown.clone());
        let (_client, handle) = spawn_session(ctx);

        shutdown.cancel();
        let (result, _) = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("guide session ignored the stop")
            .unwrap();
        assert_eq!(result.unwrap(), SessionEnd::Abandoned);
        assert!(!tmp.path().join("test6543.fits").exists());
    }

    #[tokio::test]
    async fn test_stop_does_not_interrupt_payload() {
        let tmp = TempDir::new().unwrap();
        let shutdown = CancellationToken::new();
        let ctx = SessionContext::new(Arc::new(settings(tmp.path())), 6543)
            .with_shutdown(shutdown.clone());
        let (mut client, handle) = spawn_session(ctx);

        send_header(&mut client, 6, "busy.fits 0 1 1 0").await;
        assert_eq!(read_reply(&mut client).await, ReplyCode::Accepted);
        shutdown.cancel();
        client.write_all(b"pixels").await.unwrap();

        let outcome = transferred(handle.await.unwrap().0);
        assert!(outcome.complete);
        assert_eq!(stdfs::read(tmp.path().join("busy.fits")).unwrap(), b"pixels");
    }
}
