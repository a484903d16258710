//! Shared transport helpers for the server and client modules.
//!
//! Both ends of the control channel speak newline-delimited JSON. The reader
//! and writer here own the two halves of the split control socket; every
//! message is written with a single `write_all` under a mutex, so concurrent
//! producers can never interleave partial records.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Chunk size for reads from user and local-service sockets.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Reads newline-delimited JSON records from a stream.
pub struct MessageReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Reads the next record, skipping blank lines.
    ///
    /// Returns `Ok(None)` on a clean EOF. Read failures and malformed
    /// records are decode errors; callers treat them as fatal for the
    /// channel.
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            self.line.clear();
            let n = self
                .inner
                .read_line(&mut self.line)
                .await
                .map_err(|e| Error::Decode(e.to_string()))?;
            if n == 0 {
                return Ok(None);
            }
            let record = self.line.trim();
            if record.is_empty() {
                continue;
            }
            return serde_json::from_str(record)
                .map(Some)
                .map_err(|e| Error::Decode(e.to_string()));
        }
    }
}

/// Serializes whole records onto a shared control-channel write half.
///
/// Cloning is cheap; all clones share the same underlying mutex, which is
/// what makes per-message writes atomic across tasks.
#[derive(Clone)]
pub struct MessageWriter {
    inner: Arc<Mutex<OwnedWriteHalf>>,
}

impl MessageWriter {
    pub fn new(half: OwnedWriteHalf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(half)),
        }
    }

    /// Encodes `msg` as one JSON line and writes it in a single call.
    pub async fn send<T: Serialize>(&self, msg: &T) -> Result<()> {
        let mut buf = serde_json::to_vec(msg).map_err(|e| Error::Encode(e.to_string()))?;
        buf.push(b'\n');
        self.inner
            .lock()
            .await
            .write_all(&buf)
            .await
            .map_err(|e| Error::Write(e.to_string()))
    }

    /// Shuts down the write direction, signalling EOF to the peer.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| Error::Write(e.to_string()))
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            tracing::warn!(error = %e, "failed to listen for SIGINT");
                        }
                    }
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "failed to listen for SIGINT");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for SIGINT");
        }
    }
}
