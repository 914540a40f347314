//! Shared helpers for inbound handlers.

use std::io;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::time::Instant;

use super::LiveSession;

/// Decode the `data` of an inbound envelope. A payload of the wrong shape
/// is answered with an `error` event and otherwise ignored.
pub(super) fn decode<T: DeserializeOwned>(session: &LiveSession, kind: &str, data: Value) -> Option<T> {
    match serde_json::from_value(data) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(user_id = session.user_id(), kind, "Invalid payload: {e}");
            session.error(&format!("Invalid {kind} payload"));
            None
        }
    }
}

/// Outcome of reading one newline-terminated frame.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Frame {
    Line,
    TooLong,
    Eof,
}

/// Read one frame into `buf`, buffering at most `max_len + 1` bytes.
/// The remainder of an oversized frame is consumed and discarded so the
/// next read starts on a frame boundary.
pub(super) async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, max_len: usize) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(max_len).unwrap_or(u64::MAX).saturating_add(1);
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Frame::Eof);
    }
    let content_len = if buf.ends_with(b"\n") { buf.len() - 1 } else { buf.len() };
    if content_len <= max_len {
        return Ok(Frame::Line);
    }
    skip_line(reader).await?;
    Ok(Frame::TooLong)
}

async fn skip_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        let (len, found) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        reader.consume(len);
        if found {
            return Ok(());
        }
    }
}

/// Per-connection flood protection.
pub(super) struct TokenBucket {
    tokens: f64,
    max: f64,
    refill_per_sec: f64,
    last: Instant,
    warned: bool,
}

impl TokenBucket {
    pub(super) fn new(per_sec: u32) -> Self {
        let rate = f64::from(per_sec.max(1));
        Self {
            tokens: rate,
            max: rate,
            refill_per_sec: rate,
            last: Instant::now(),
            warned: false,
        }
    }

    /// Take one token if available.
    pub(super) fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.max);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.warned = false;
            true
        } else {
            false
        }
    }

    /// True the first time it is called after a denial, false for the rest
    /// of that burst.
    pub(super) fn first_denial(&mut self) -> bool {
        !std::mem::replace(&mut self.warned, true)
    }
}
