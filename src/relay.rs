//! Log relay: turns the backend's multiplexed log stream into [`LogLine`]s
//!
//! The stream carries frames of the form `[stream, 0, 0, 0, size (u32 BE)]`
//! followed by `size` bytes of payload. Each frame becomes one line, in the
//! order it was read.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, FramedRead};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::backend::LogStream;

const HEADER_LEN: usize = 8;

const STREAM_STDIN: u8 = 0;
const STREAM_STDOUT: u8 = 1;
const STREAM_STDERR: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub source: LogSource,
    pub payload: Bytes,
}

impl LogFrame {
    pub fn new(source: LogSource, payload: impl Into<Bytes>) -> Self {
        Self {
            source,
            payload: payload.into(),
        }
    }
}

/// One unit of sandbox output, forwarded byte for byte
///
/// Payloads are not decoded: the daemon may split a line (or a multi-byte
/// character) across frames, and the consumer sees the bytes exactly as the
/// process wrote them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub source: LogSource,
    pub payload: Bytes,
}

impl From<LogFrame> for LogLine {
    fn from(frame: LogFrame) -> Self {
        Self {
            source: frame.source,
            payload: frame.payload,
        }
    }
}

/// Codec for the length-prefixed stdout/stderr frame format
#[derive(Debug, Default, Clone, Copy)]
pub struct MultiplexedCodec;

impl Decoder for MultiplexedCodec {
    type Item = LogFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<LogFrame>> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let source = match src[0] {
            // stdin only shows up when attached; treat it like stdout
            STREAM_STDIN | STREAM_STDOUT => LogSource::Stdout,
            STREAM_STDERR => LogSource::Stderr,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown log stream type {other}"),
                ));
            }
        };
        let size = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;

        if src.len() < HEADER_LEN + size {
            src.reserve(HEADER_LEN + size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(size).freeze();
        Ok(Some(LogFrame { source, payload }))
    }
}

impl Encoder<LogFrame> for MultiplexedCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: LogFrame, dst: &mut BytesMut) -> io::Result<()> {
        let size = u32::try_from(frame.payload.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "log frame exceeds 4 GiB")
        })?;

        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(match frame.source {
            LogSource::Stdout => STREAM_STDOUT,
            LogSource::Stderr => STREAM_STDERR,
        });
        dst.put_bytes(0, 3);
        dst.put_u32(size);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// Encodes a single frame into its wire form
pub fn encode_frame(frame: LogFrame) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    MultiplexedCodec.encode(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Why a relay stopped forwarding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayExit {
    /// The stream ended, the sandboxed process is done
    Ended,
    Cancelled,
    /// The receiving side of the line channel was dropped
    ConsumerGone,
    /// Reading the stream failed for some other reason
    Failed(String),
}

/// Forwards frames from `stream` into `sink` until the stream ends, `cancel`
/// fires, or a read fails. Nothing is sent after cancellation is observed.
pub async fn relay(
    stream: LogStream,
    cancel: CancellationToken,
    sink: UnboundedSender<LogLine>,
) -> RelayExit {
    let mut frames = FramedRead::new(StreamReader::new(stream), MultiplexedCodec);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RelayExit::Cancelled,
            next = frames.next() => next,
        };

        if cancel.is_cancelled() {
            return RelayExit::Cancelled;
        }

        let frame = match next {
            None => return RelayExit::Ended,
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                log::error!("Failed to read sandbox log stream: {e}");
                return RelayExit::Failed(e.to_string());
            }
        };

        if frame.payload.is_empty() {
            continue;
        }

        if sink.send(LogLine::from(frame)).is_err() {
            log::warn!("Log consumer went away, relay stopping");
            return RelayExit::ConsumerGone;
        }
    }
}

pub fn spawn_relay(
    stream: LogStream,
    cancel: CancellationToken,
    sink: UnboundedSender<LogLine>,
) -> JoinHandle<RelayExit> {
    tokio::spawn(relay(stream, cancel, sink))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::stream;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::BackendError;

    fn wire(frames: &[(LogSource, &str)]) -> Vec<u8> {
        frames
            .iter()
            .flat_map(|(source, text)| {
                encode_frame(LogFrame::new(*source, text.to_string()))
                    .unwrap()
                    .to_vec()
            })
            .collect()
    }

    fn chunked(bytes: Vec<u8>, chunk: usize) -> LogStream {
        let chunks: Vec<Result<Bytes, BackendError>> = bytes
            .chunks(chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(stream::iter(chunks))
    }

    fn channel_stream() -> (mpsc::UnboundedSender<Result<Bytes, BackendError>>, LogStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (tx, Box::pin(stream))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LogLine>) -> Vec<LogLine> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let bytes = wire(&[(LogSource::Stderr, "partial")]);
        let mut codec = MultiplexedCodec;
        let mut buf = BytesMut::from(&bytes[..5]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&bytes[5..10]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&bytes[10..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(LogFrame::new(LogSource::Stderr, "partial"))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_unknown_stream_type() {
        let mut buf = BytesMut::from(&[7u8, 0, 0, 0, 0, 0, 0, 1, b'x'][..]);
        let err = MultiplexedCodec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_stdin_frames_read_as_stdout() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0, 0, 0, 0, 2, b'h', b'i'][..]);
        let frame = MultiplexedCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.source, LogSource::Stdout);
    }

    #[tokio::test]
    async fn test_interleaved_frames_keep_arrival_order() {
        let input = [
            (LogSource::Stdout, "compiling\n"),
            (LogSource::Stderr, "warning: unused\n"),
            (LogSource::Stdout, "test 1 ok\n"),
            (LogSource::Stderr, "test 2 failed\n"),
            (LogSource::Stdout, "score: 50\n"),
        ];
        // Chunk size 3 splits headers and payloads across reads
        let stream = chunked(wire(&input), 3);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let exit = relay(stream, CancellationToken::new(), tx).await;
        assert_eq!(exit, RelayExit::Ended);

        let lines: Vec<(LogSource, Bytes)> = drain(&mut rx)
            .into_iter()
            .map(|line| (line.source, line.payload))
            .collect();
        let expected: Vec<(LogSource, Bytes)> = input
            .iter()
            .map(|(source, text)| (*source, Bytes::from(text.to_string())))
            .collect();
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn test_character_split_across_frames_is_forwarded_intact() {
        let mut bytes = Vec::new();
        for payload in [&b"caf\xC3"[..], &b"\xA9\n"[..], &b"\xFFraw\n"[..]] {
            let frame = LogFrame::new(LogSource::Stdout, Bytes::copy_from_slice(payload));
            bytes.extend_from_slice(&encode_frame(frame).unwrap());
        }
        let (tx, mut rx) = mpsc::unbounded_channel();

        let exit = relay(chunked(bytes, 5), CancellationToken::new(), tx).await;
        assert_eq!(exit, RelayExit::Ended);

        let joined: Vec<u8> = drain(&mut rx)
            .iter()
            .flat_map(|line| line.payload.to_vec())
            .collect();
        assert_eq!(joined, b"caf\xC3\xA9\n\xFFraw\n".to_vec());
        assert_eq!(std::str::from_utf8(&joined[..6]).unwrap(), "café\n");
    }

    #[tokio::test]
    async fn test_nothing_forwarded_after_cancel() {
        let (bytes_tx, stream) = channel_stream();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = spawn_relay(stream, cancel.clone(), tx);

        bytes_tx
            .send(Ok(Bytes::from(wire(&[(LogSource::Stdout, "before\n")]))))
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"before\n"));

        cancel.cancel();
        let _ = bytes_tx.send(Ok(Bytes::from(wire(&[(LogSource::Stdout, "after\n")]))));

        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("relay did not stop after cancellation")
            .unwrap();
        assert_eq!(exit, RelayExit::Cancelled);
        assert!(drain(&mut rx).is_empty());
        // The relay dropped its sender on exit
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_read() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = spawn_relay(
            Box::pin(stream::pending::<Result<Bytes, BackendError>>()),
            cancel.clone(),
            tx,
        );

        cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("relay blocked on a read after cancellation")
            .unwrap();
        assert_eq!(exit, RelayExit::Cancelled);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_a_read_failure() {
        let mut bytes = wire(&[(LogSource::Stdout, "whole\n"), (LogSource::Stdout, "cut off")]);
        bytes.truncate(bytes.len() - 3);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let exit = relay(chunked(bytes, 64), CancellationToken::new(), tx).await;
        assert!(matches!(exit, RelayExit::Failed(_)), "got {exit:?}");
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_backend_error_is_a_read_failure() {
        let items: Vec<Result<Bytes, BackendError>> = vec![
            Ok(Bytes::from(wire(&[(LogSource::Stdout, "one\n")]))),
            Err(BackendError::Transport("connection reset".to_string())),
        ];
        let (tx, mut rx) = mpsc::unbounded_channel();

        let exit = relay(Box::pin(stream::iter(items)), CancellationToken::new(), tx).await;
        match exit {
            RelayExit::Failed(reason) => assert!(reason.contains("connection reset")),
            other => panic!("unexpected exit {other:?}"),
        }
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_consumer_stops_relay() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let stream = chunked(wire(&[(LogSource::Stdout, "nobody listens\n")]), 64);

        let exit = relay(stream, CancellationToken::new(), tx).await;
        assert_eq!(exit, RelayExit::ConsumerGone);
    }

    #[tokio::test]
    async fn test_empty_frames_are_skipped() {
        let stream = chunked(wire(&[(LogSource::Stdout, ""), (LogSource::Stderr, "x")]), 64);
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert_eq!(relay(stream, CancellationToken::new(), tx).await, RelayExit::Ended);
        let lines = drain(&mut rx);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].source, LogSource::Stderr);
    }
}
