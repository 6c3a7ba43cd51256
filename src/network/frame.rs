use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{self, Instant};
use tracing::trace;

use crate::client::Timings;
use crate::{AppError, AppResult};

const HEADER_SEPARATOR: &[u8; 4] = b"\r\n\r\n";

/// Raw response head plus whatever body bytes arrived in the same reads.
#[derive(Debug)]
pub struct ResponseFrame {
    /// Status line and header lines, without the terminating blank line.
    pub head: Bytes,
    pub leftover: BytesMut,
}

/// Reads from a transport until the header/body boundary is found.
#[derive(Debug, Clone)]
pub struct FrameReader {
    buffer_size: usize,
    read_timeout: Duration,
    max_header_bytes: usize,
    zero_read_delay: Duration,
    detect_closed: bool,
}

impl FrameReader {
    pub fn new(buffer_size: usize, read_timeout: Duration, max_header_bytes: usize) -> Self {
        FrameReader {
            buffer_size: buffer_size.max(HEADER_SEPARATOR.len()),
            read_timeout,
            max_header_bytes,
            zero_read_delay: Duration::from_millis(10),
            detect_closed: false,
        }
    }

    pub fn with_zero_read_delay(mut self, delay: Duration) -> Self {
        self.zero_read_delay = delay;
        self
    }

    /// Fails with [`AppError::ConnectionClosed`] when the very first read
    /// returns no bytes, instead of waiting out the timeout. Meant for reused
    /// connections the peer may have closed between requests.
    pub fn with_closed_detection(mut self, detect_closed: bool) -> Self {
        self.detect_closed = detect_closed;
        self
    }

    /// Reads until `\r\n\r\n` shows up in the accumulated bytes.
    ///
    /// A separator split across reads is still found, every read rescans from
    /// the last three bytes of what was already accumulated. Empty reads are
    /// not errors here, they only burn the timeout budget.
    pub async fn read_frame<R>(&self, reader: &mut R, timings: &mut Timings) -> AppResult<ResponseFrame>
    where
        R: AsyncRead + Unpin,
    {
        let deadline = Instant::now() + self.read_timeout;
        let mut accumulated = BytesMut::with_capacity(self.buffer_size);
        let mut read_buffer = vec![0u8; self.buffer_size];

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(AppError::HeaderTimeout(self.read_timeout));
            }
            let read = match time::timeout(deadline - now, reader.read(&mut read_buffer)).await {
                Ok(result) => result?,
                Err(_) => return Err(AppError::HeaderTimeout(self.read_timeout)),
            };
            if read == 0 {
                if self.detect_closed && accumulated.is_empty() {
                    return Err(AppError::ConnectionClosed);
                }
                time::sleep(self.zero_read_delay.min(deadline.saturating_duration_since(Instant::now())))
                    .await;
                continue;
            }
            timings.record_read_chunk();

            let scan_from = accumulated.len().saturating_sub(HEADER_SEPARATOR.len() - 1);
            accumulated.extend_from_slice(&read_buffer[..read]);
            if let Some(position) = find_separator(&accumulated, scan_from) {
                let mut head = accumulated;
                let leftover = head.split_off(position + HEADER_SEPARATOR.len());
                head.truncate(position);
                timings.header_received = Some(timings.elapsed());
                trace!(
                    "response head of {} bytes framed, {} body bytes buffered",
                    head.len(),
                    leftover.len()
                );
                return Ok(ResponseFrame {
                    head: head.freeze(),
                    leftover,
                });
            }
            if accumulated.len() > self.max_header_bytes {
                return Err(AppError::HeaderTooLarge(self.max_header_bytes));
            }
        }
    }
}

fn find_separator(buffer: &[u8], from: usize) -> Option<usize> {
    if buffer.len() < HEADER_SEPARATOR.len() {
        return None;
    }
    buffer[from..]
        .windows(HEADER_SEPARATOR.len())
        .position(|window| window == HEADER_SEPARATOR)
        .map(|offset| from + offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FragmentedReader;

    const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    const HEAD: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5";

    fn reader() -> FrameReader {
        FrameReader::new(16, Duration::from_millis(200), 1024)
    }

    #[tokio::test]
    async fn frame_in_single_read() {
        let mut source = FragmentedReader::new(vec![RESPONSE.to_vec()]);
        let mut timings = Timings::start();
        let frame = FrameReader::new(1024, Duration::from_millis(200), 1024)
            .read_frame(&mut source, &mut timings)
            .await
            .unwrap();
        assert_eq!(&frame.head[..], HEAD);
        assert_eq!(&frame.leftover[..], b"hello");
        assert!(timings.header_received.is_some());
    }

    #[tokio::test]
    async fn frame_split_at_every_offset() {
        for cut in 1..RESPONSE.len() {
            let mut source = FragmentedReader::split_at(RESPONSE, &[cut]);
            let frame = reader()
                .read_frame(&mut source, &mut Timings::start())
                .await
                .unwrap();
            assert_eq!(&frame.head[..], HEAD, "cut at {cut}");
            // with a 16 byte read buffer only bytes of the final read leak
            let head_end = HEAD.len() + 4;
            assert!(RESPONSE[head_end..].starts_with(&frame.leftover), "cut at {cut}");
        }
    }

    #[tokio::test]
    async fn frame_split_inside_separator() {
        let separator_start = HEAD.len();
        for inner in 1..4 {
            let cut = separator_start + inner;
            let mut source = FragmentedReader::split_at(RESPONSE, &[cut]);
            let frame = FrameReader::new(1024, Duration::from_millis(200), 1024)
                .read_frame(&mut source, &mut Timings::start())
                .await
                .unwrap();
            assert_eq!(&frame.head[..], HEAD);
            assert_eq!(&frame.leftover[..], b"hello");
        }
    }

    #[tokio::test]
    async fn frame_byte_by_byte() {
        let cuts: Vec<usize> = (1..RESPONSE.len()).collect();
        let mut source = FragmentedReader::split_at(RESPONSE, &cuts);
        let frame = reader()
            .read_frame(&mut source, &mut Timings::start())
            .await
            .unwrap();
        assert_eq!(&frame.head[..], HEAD);
        assert!(frame.leftover.is_empty());
    }

    #[tokio::test]
    async fn missing_separator_times_out() {
        let mut source = FragmentedReader::new(vec![b"HTTP/1.1 200 OK\r\n".to_vec()]);
        let result = FrameReader::new(64, Duration::from_millis(50), 1024)
            .read_frame(&mut source, &mut Timings::start())
            .await;
        assert!(matches!(result, Err(AppError::HeaderTimeout(_))));
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut source = FragmentedReader::new(vec![vec![b'a'; 300]]);
        let result = FrameReader::new(512, Duration::from_millis(200), 128)
            .read_frame(&mut source, &mut Timings::start())
            .await;
        assert!(matches!(result, Err(AppError::HeaderTooLarge(128))));
    }

    #[tokio::test]
    async fn zero_byte_reads_do_not_fail() {
        // an empty slice reader returns Ok(0) forever
        let mut source: &[u8] = &[];
        let result = FrameReader::new(64, Duration::from_millis(60), 1024)
            .with_zero_read_delay(Duration::from_millis(5))
            .read_frame(&mut source, &mut Timings::start())
            .await;
        assert!(matches!(result, Err(AppError::HeaderTimeout(_))));
    }

    #[tokio::test]
    async fn closed_detection_fails_fast_on_empty_stream() {
        let mut source: &[u8] = &[];
        let result = FrameReader::new(64, Duration::from_secs(5), 1024)
            .with_closed_detection(true)
            .read_frame(&mut source, &mut Timings::start())
            .await;
        assert!(matches!(result, Err(AppError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn closed_detection_ignores_empty_reads_after_head_bytes() {
        let mut source = FragmentedReader::new(vec![b"HTTP/1.1 200".to_vec(), Vec::new()]);
        let result = FrameReader::new(64, Duration::from_millis(60), 1024)
            .with_zero_read_delay(Duration::from_millis(5))
            .with_closed_detection(true)
            .read_frame(&mut source, &mut Timings::start())
            .await;
        assert!(matches!(result, Err(AppError::HeaderTimeout(_))));
    }
}
