//! Reassembles response documents from a byte stream without length prefix.
//!
//! A frame ends at the first `</response>` sentinel. The server never emits
//! the sentinel before a genuine document close, so scanning for it is
//! sufficient.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{DominoError, Result};

pub(crate) const SENTINEL: &[u8] = b"</response>";
const READ_CHUNK: usize = 8 * 1024;

pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    // Prefix of `buf` already known to hold no complete sentinel.
    scanned: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            scanned: 0,
        }
    }

    /// Reads until one complete document is buffered and returns it.
    ///
    /// Bytes following the sentinel stay buffered for the next call.
    pub async fn read_frame(&mut self) -> Result<String> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(end) = self.find_sentinel() {
                let rest = self.buf.split_off(end);
                let frame = std::mem::replace(&mut self.buf, rest);
                self.scanned = 0;
                return String::from_utf8(frame).map_err(|err| {
                    DominoError::MalformedDocument(format!("response is not valid UTF-8: {err}"))
                });
            }

            let read = self
                .reader
                .read(&mut chunk)
                .await
                .map_err(DominoError::Transport)?;
            if read == 0 {
                return Err(DominoError::IncompleteFrame);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Returns the end offset of the first sentinel, resuming where the last
    /// scan stopped.
    fn find_sentinel(&mut self) -> Option<usize> {
        let start = self.scanned.saturating_sub(SENTINEL.len() - 1);
        let found = self.buf[start..]
            .windows(SENTINEL.len())
            .position(|window| window == SENTINEL)
            .map(|offset| start + offset + SENTINEL.len());
        if found.is_none() {
            self.scanned = self.buf.len();
        }
        found
    }

    #[cfg(test)]
    fn buffered(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::FrameReader;
    use crate::DominoError;

    #[tokio::test]
    async fn reads_frame_split_across_writes() {
        let (mut server, client) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for part in ["<response><sta", "tus>ok</status></resp", "onse>"] {
                server.write_all(part.as_bytes()).await.expect("write part");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            server
        });

        let mut frames = FrameReader::new(client);
        let frame = frames.read_frame().await.expect("frame");
        assert_eq!(frame, "<response><status>ok</status></response>");
        drop(writer.await.expect("writer task"));
    }

    #[tokio::test]
    async fn sentinel_split_on_chunk_boundary_is_found() {
        let (mut server, client) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server.write_all(b"<response></resp").await.expect("write");
            tokio::time::sleep(Duration::from_millis(5)).await;
            server.write_all(b"onse>").await.expect("write");
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let mut frames = FrameReader::new(client);
        assert_eq!(
            frames.read_frame().await.expect("frame"),
            "<response></response>"
        );
    }

    #[tokio::test]
    async fn trailing_bytes_start_next_frame() {
        let input: &[u8] =
            b"<response><status>ok</status></response>\n<response><status>err</status></response>";
        let mut frames = FrameReader::new(input);

        let first = frames.read_frame().await.expect("first frame");
        assert_eq!(first, "<response><status>ok</status></response>");
        assert!(frames.buffered().starts_with(b"\n<response>"));

        let second = frames.read_frame().await.expect("second frame");
        assert_eq!(second, "\n<response><status>err</status></response>");

        let err = frames.read_frame().await.expect_err("stream exhausted");
        assert!(matches!(err, DominoError::IncompleteFrame));
    }

    #[tokio::test]
    async fn stream_end_before_sentinel_is_incomplete() {
        let input: &[u8] = b"<response><status>ok</status>";
        let mut frames = FrameReader::new(input);
        let err = frames.read_frame().await.expect_err("must fail");
        assert!(matches!(err, DominoError::IncompleteFrame));
    }

    #[tokio::test]
    async fn invalid_utf8_frame_is_malformed() {
        let input: &[u8] = b"<response>\xff\xfe</response>";
        let mut frames = FrameReader::new(input);
        let err = frames.read_frame().await.expect_err("must fail");
        assert!(matches!(err, DominoError::MalformedDocument(_)));
    }
}
