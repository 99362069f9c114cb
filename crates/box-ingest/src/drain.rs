//! Drains a request body into a sink as one awaited loop with explicit exits.
use crate::error::UploadError;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum DrainOutcome {
    Complete(u64),
    /// The body stream itself failed (client reset, premature close).
    StreamError(String),
    /// Writing to the local destination failed.
    WriteError(io::Error),
    Cancelled { written: u64 },
    LimitExceeded { written: u64 },
}

impl DrainOutcome {
    pub fn into_result(self, limit: u64) -> Result<u64, UploadError> {
        match self {
            Self::Complete(n) => Ok(n),
            Self::StreamError(reason) => Err(UploadError::Transport(reason)),
            Self::WriteError(e) => Err(UploadError::Storage(e)),
            Self::Cancelled { .. } => Err(UploadError::Cancelled),
            Self::LimitExceeded { written } => Err(UploadError::FileTooLarge { size: written, limit }),
        }
    }
}

/// Copy `body` into `sink`, stopping early once more than `limit` bytes arrived
/// or `cancel` fires. The sink is flushed on completion only.
pub async fn drain<S, E, W>(body: S, sink: &mut W, limit: u64, cancel: &CancellationToken) -> DrainOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
    W: AsyncWrite + Unpin,
{
    futures_util::pin_mut!(body);
    let mut written = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return DrainOutcome::Cancelled { written },
            next = body.next() => next,
        };
        match next {
            None => break,
            Some(Err(e)) => return DrainOutcome::StreamError(e.to_string()),
            Some(Ok(chunk)) => {
                written += chunk.len() as u64;
                if written > limit { return DrainOutcome::LimitExceeded { written }; }
                if let Err(e) = sink.write_all(&chunk).await { return DrainOutcome::WriteError(e); }
            }
        }
    }
    if let Err(e) = sink.flush().await { return DrainOutcome::WriteError(e); }
    DrainOutcome::Complete(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn ok_stream(parts: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes, io::Error>> {
        stream::iter(parts.iter().map(|p| Ok(Bytes::from_static(p))).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn completes_with_byte_count() {
        let mut sink = Vec::new();
        let out = drain(ok_stream(&[b"abc", b"", b"defg"]), &mut sink, 100, &CancellationToken::new()).await;
        assert!(matches!(out, DrainOutcome::Complete(7)));
        assert_eq!(sink, b"abcdefg");
    }

    #[tokio::test]
    async fn stream_error_is_reported() {
        let s = stream::iter(vec![Ok(Bytes::from_static(b"ab")), Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer closed"))]);
        let mut sink = Vec::new();
        let out = drain(s, &mut sink, 100, &CancellationToken::new()).await;
        assert!(matches!(out, DrainOutcome::StreamError(ref m) if m.contains("peer closed")));
        assert!(matches!(out.into_result(100), Err(UploadError::Transport(_))));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_stalled_body() {
        let cancel = CancellationToken::new();
        let s = ok_stream(&[b"head"]).chain(stream::pending());
        let trigger = cancel.clone();
        tokio::spawn(async move { tokio::task::yield_now().await; trigger.cancel(); });
        let mut sink = Vec::new();
        let out = drain(s, &mut sink, 100, &cancel).await;
        assert!(matches!(out, DrainOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn stops_once_limit_is_crossed() {
        let mut sink = Vec::new();
        let out = drain(ok_stream(&[b"1234", b"5678", b"9"]), &mut sink, 6, &CancellationToken::new()).await;
        assert!(matches!(out, DrainOutcome::LimitExceeded { written: 8 }));
        assert_eq!(sink, b"1234");
    }
}
