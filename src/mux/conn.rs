//! Classified connection handed to a protocol engine

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tonic::transport::server::Connected;

use super::matcher::{FLAG_ACK, FRAME_HEADER_LEN, FRAME_SETTINGS, Sniffed, frame_header};

const READ_CHUNK: usize = 8 * 1024;

/// A connection whose sniffed bytes are replayed before the live stream
pub struct MuxConn<S> {
    inner: S,
    prefix: Bytes,
    filter: Option<SettingsAckFilter>,
}

impl<S> MuxConn<S> {
    /// Wrap a sniffed stream
    pub(crate) fn new(inner: S, sniffed: Sniffed) -> Self {
        Self {
            inner,
            prefix: sniffed.prefix,
            filter: sniffed.pending_ack.map(SettingsAckFilter::new),
        }
    }

    /// Wrap a stream with bytes to replay and no filtering
    pub fn with_prefix(inner: S, prefix: Bytes) -> Self {
        Self {
            inner,
            prefix,
            filter: None,
        }
    }

    /// The underlying stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> std::fmt::Debug for MuxConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConn")
            .field("replay", &self.prefix.len())
            .field("filtering", &self.filter.is_some())
            .finish_non_exhaustive()
    }
}

impl<S: Connected> Connected for MuxConn<S> {
    type ConnectInfo = S::ConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MuxConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let Self {
            inner,
            prefix,
            filter,
        } = self.get_mut();

        if !prefix.is_empty() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }

        if let Some(active) = filter.as_mut() {
            loop {
                if !active.output.is_empty() {
                    let n = active.output.len().min(buf.remaining());
                    buf.put_slice(&active.output.split_to(n));
                    return Poll::Ready(Ok(()));
                }
                if active.is_drained() {
                    *filter = None;
                    break;
                }
                if active.eof {
                    active.flush_input();
                    if active.output.is_empty() {
                        return Poll::Ready(Ok(()));
                    }
                    continue;
                }

                let mut chunk = [0u8; READ_CHUNK];
                let mut read = ReadBuf::new(&mut chunk);
                ready!(Pin::new(&mut *inner).poll_read(cx, &mut read))?;
                if read.filled().is_empty() {
                    active.eof = true;
                } else {
                    active.push(read.filled());
                }
            }
        }

        Pin::new(inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MuxConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Removes the first empty SETTINGS ACK from an HTTP/2 frame stream
///
/// Input must start at a frame boundary. Frames are copied through unchanged
/// until the ACK is found; after that all bytes pass untouched.
struct SettingsAckFilter {
    input: BytesMut,
    output: BytesMut,
    // Payload bytes of the current frame still to copy
    remaining: usize,
    stripped: bool,
    eof: bool,
}

impl SettingsAckFilter {
    fn new(pending: Bytes) -> Self {
        let mut filter = Self {
            input: BytesMut::new(),
            output: BytesMut::new(),
            remaining: 0,
            stripped: false,
            eof: false,
        };
        filter.push(&pending);
        filter
    }

    fn push(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);
        self.process();
    }

    fn process(&mut self) {
        loop {
            if self.stripped {
                let rest = self.input.split();
                self.output.unsplit(rest);
                return;
            }

            if self.remaining > 0 {
                let n = self.remaining.min(self.input.len());
                if n == 0 {
                    return;
                }
                let payload = self.input.split_to(n);
                self.output.unsplit(payload);
                self.remaining -= n;
                continue;
            }

            if self.input.len() < FRAME_HEADER_LEN {
                return;
            }

            let (len, kind, flags) = frame_header(&self.input[..FRAME_HEADER_LEN]);
            if kind == FRAME_SETTINGS && flags & FLAG_ACK != 0 && len == 0 {
                self.input.advance(FRAME_HEADER_LEN);
                self.stripped = true;
                tracing::trace!("removed settings ack for sniffer settings");
                continue;
            }

            let header = self.input.split_to(FRAME_HEADER_LEN);
            self.output.unsplit(header);
            self.remaining = len;
        }
    }

    /// Pass along a trailing partial frame once the peer stops sending
    fn flush_input(&mut self) {
        let rest = self.input.split();
        self.output.unsplit(rest);
    }

    fn is_drained(&self) -> bool {
        self.stripped && self.input.is_empty() && self.output.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    fn frame(kind: u8, flags: u8, payload: &[u8]) -> Vec<u8> {
        let len = u32::try_from(payload.len()).unwrap().to_be_bytes();
        let mut out = vec![len[1], len[2], len[3], kind, flags, 0, 0, 0, 0];
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn replays_prefix_before_live_bytes() {
        let (mut client, server) = duplex(64);
        client.write_all(b" world").await.unwrap();
        drop(client);

        let mut conn = MuxConn::with_prefix(server, Bytes::from_static(b"hello"));
        let mut out = String::new();
        conn.read_to_string(&mut out).await.unwrap();

        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn writes_go_straight_through() {
        let (mut client, server) = duplex(64);
        let mut conn = MuxConn::with_prefix(server, Bytes::from_static(b"ignored"));
        conn.write_all(b"pong").await.unwrap();

        let mut got = [0u8; 4];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");
    }

    #[test]
    fn filter_removes_only_first_ack() {
        let data = frame(0x0, 0x1, b"abc");
        let ack = frame(FRAME_SETTINGS, FLAG_ACK, &[]);

        let mut input = data.clone();
        input.extend(&ack);
        input.extend(&ack);

        let mut filter = SettingsAckFilter::new(Bytes::from(input));

        let mut expected = data;
        expected.extend(&ack);
        assert_eq!(&filter.output[..], &expected[..]);
        assert!(filter.stripped);
        filter.output.clear();
        assert!(filter.is_drained());
    }

    #[test]
    fn filter_handles_frames_split_across_reads() {
        let headers = frame(0x1, 0x4, b"header-block");
        let ack = frame(FRAME_SETTINGS, FLAG_ACK, &[]);

        let mut stream = headers.clone();
        stream.extend(&ack);
        stream.extend(b"tail");

        let mut filter = SettingsAckFilter::new(Bytes::new());
        for byte in &stream {
            filter.push(std::slice::from_ref(byte));
        }

        let mut expected = headers;
        expected.extend(b"tail");
        assert_eq!(&filter.output[..], &expected[..]);
    }

    #[test]
    fn ack_with_payload_is_not_removed() {
        let odd = frame(FRAME_SETTINGS, FLAG_ACK, &[0, 0, 0, 0, 0, 0]);
        let filter = SettingsAckFilter::new(Bytes::from(odd.clone()));
        assert_eq!(&filter.output[..], &odd[..]);
        assert!(!filter.stripped);
    }

    #[tokio::test]
    async fn connection_strips_ack_arriving_after_handoff() {
        let (mut client, server) = duplex(1024);
        let ping = frame(0x6, 0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let ack = frame(FRAME_SETTINGS, FLAG_ACK, &[]);

        let mut live = ack.clone();
        live.extend(&ping);
        client.write_all(&live).await.unwrap();
        drop(client);

        let sniffed = Sniffed {
            prefix: Bytes::from_static(b"PREFIX"),
            pending_ack: Some(Bytes::new()),
            ..Sniffed::default()
        };
        let mut conn = MuxConn::new(server, sniffed);

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();

        let mut expected = b"PREFIX".to_vec();
        expected.extend(&ping);
        assert_eq!(out, expected);
    }
}
