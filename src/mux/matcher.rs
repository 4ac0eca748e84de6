//! Connection classification
//!
//! A new connection is sniffed before any protocol engine sees it. Plain
//! HTTP/1 is recognized as soon as the bytes diverge from the HTTP/2 client
//! preface. For HTTP/2 the frames are read up to the first complete header
//! block, which is HPACK-decoded so matchers can test header values such as
//! `content-type: application/grpc`.
//!
//! Some clients wait for the server's SETTINGS frame before sending headers.
//! A matcher created with [`Matcher::with_settings`] makes the sniffer answer
//! the client's SETTINGS with an empty one; the client's acknowledgement of
//! that frame is later removed from the stream so the real server never sees
//! an ACK it did not ask for.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// HTTP/2 client connection preface
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Upper bound on bytes buffered while sniffing one connection
pub const MAX_SNIFF_BYTES: usize = 64 * 1024;

pub(crate) const FRAME_HEADER_LEN: usize = 9;
pub(crate) const FRAME_SETTINGS: u8 = 0x4;
pub(crate) const FLAG_ACK: u8 = 0x1;

const FRAME_HEADERS: u8 = 0x1;
const FRAME_GOAWAY: u8 = 0x7;
const FRAME_CONTINUATION: u8 = 0x9;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// SETTINGS frame with no parameters on stream 0
const EMPTY_SETTINGS: [u8; FRAME_HEADER_LEN] = [0, 0, 0, FRAME_SETTINGS, 0, 0, 0, 0, 0];

/// Predicate deciding which listener receives a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Accept every connection
    Any,

    /// Accept HTTP/2 connections whose first header block carries `name`
    Http2Header {
        name: String,
        value: String,
        prefix: bool,
        send_settings: bool,
    },
}

impl Matcher {
    /// Matcher accepting every connection
    #[must_use]
    pub fn any() -> Self {
        Self::Any
    }

    /// HTTP/2 connections with a header equal to `value`
    #[must_use]
    pub fn http2_header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Http2Header {
            name: name.into().to_ascii_lowercase(),
            value: value.into(),
            prefix: false,
            send_settings: false,
        }
    }

    /// HTTP/2 connections with a header starting with `value`
    #[must_use]
    pub fn http2_header_prefix(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Http2Header {
            name: name.into().to_ascii_lowercase(),
            value: value.into(),
            prefix: true,
            send_settings: false,
        }
    }

    /// Answer the client's SETTINGS while sniffing
    #[must_use]
    pub fn with_settings(mut self) -> Self {
        if let Self::Http2Header { send_settings, .. } = &mut self {
            *send_settings = true;
        }
        self
    }

    /// gRPC traffic: HTTP/2 with `content-type: application/grpc*`
    #[must_use]
    pub fn grpc() -> Self {
        Self::http2_header_prefix("content-type", "application/grpc").with_settings()
    }

    pub(crate) fn sends_settings(&self) -> bool {
        matches!(
            self,
            Self::Http2Header {
                send_settings: true,
                ..
            }
        )
    }

    /// Whether a sniffed connection satisfies this matcher
    #[must_use]
    pub fn matches(&self, sniffed: &Sniffed) -> bool {
        match self {
            Self::Any => true,
            Self::Http2Header {
                name,
                value,
                prefix,
                ..
            } => sniffed.header_values(name.as_bytes()).any(|found| {
                if *prefix {
                    found.starts_with(value.as_bytes())
                } else {
                    found == value.as_bytes()
                }
            }),
        }
    }
}

/// What the sniffer learned about a connection
#[derive(Debug, Default)]
pub struct Sniffed {
    /// Bytes consumed from the socket that must be replayed
    pub(crate) prefix: Bytes,

    /// Set when a SETTINGS ACK for the sniffer's own SETTINGS is still
    /// expected; holds the buffered bytes from the first unparsed frame on
    pub(crate) pending_ack: Option<Bytes>,

    pub(crate) http2: bool,
    pub(crate) headers: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Sniffed {
    fn plain(buf: BytesMut) -> Self {
        Self {
            prefix: buf.freeze(),
            ..Self::default()
        }
    }

    /// Whether the connection opened with the HTTP/2 preface
    #[must_use]
    pub fn is_http2(&self) -> bool {
        self.http2
    }

    /// Decoded fields of the first header block, if one was read
    #[must_use]
    pub fn headers(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.headers
    }

    /// All values of a (lowercase) header field
    pub fn header_values<'a>(&'a self, name: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.as_slice() == name)
            .map(|(_, v)| v.as_slice())
    }
}

/// Read enough of a connection to classify it
///
/// Returns once the connection is known not to be HTTP/2, once the first
/// header block is decoded, or when the peer stops sending. Nothing read is
/// lost: [`Sniffed`] carries every byte for replay.
///
/// # Errors
///
/// Returns error if reading or writing the socket fails
pub async fn sniff<IO>(io: &mut IO, send_settings: bool) -> io::Result<Sniffed>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let n = buf.len().min(HTTP2_PREFACE.len());
        if buf[..n] != HTTP2_PREFACE[..n] {
            return Ok(Sniffed::plain(buf));
        }
        if buf.len() >= HTTP2_PREFACE.len() {
            break;
        }
        if io.read_buf(&mut buf).await? == 0 {
            return Ok(Sniffed::plain(buf));
        }
    }

    let mut pos = HTTP2_PREFACE.len();
    let mut settings_sent = false;
    let mut ack_at = None;
    let mut block: Option<Vec<u8>> = None;

    let headers = loop {
        if !fill(io, &mut buf, pos + FRAME_HEADER_LEN).await? {
            break None;
        }
        let (len, kind, flags) = frame_header(&buf[pos..pos + FRAME_HEADER_LEN]);
        let end = pos + FRAME_HEADER_LEN + len;
        if !fill(io, &mut buf, end).await? {
            break None;
        }

        if block.is_some() && kind != FRAME_CONTINUATION {
            // Header block interrupted
            break None;
        }

        let payload = &buf[pos + FRAME_HEADER_LEN..end];
        let mut complete = false;

        match kind {
            FRAME_SETTINGS if flags & FLAG_ACK != 0 => {
                if settings_sent && ack_at.is_none() && len == 0 {
                    ack_at = Some(pos);
                }
            }
            FRAME_SETTINGS => {
                if send_settings && !settings_sent {
                    io.write_all(&EMPTY_SETTINGS).await?;
                    io.flush().await?;
                    settings_sent = true;
                }
            }
            FRAME_HEADERS => {
                let Some(fragment) = header_fragment(payload, flags) else {
                    break None;
                };
                block = Some(fragment.to_vec());
                complete = flags & FLAG_END_HEADERS != 0;
            }
            FRAME_CONTINUATION => {
                let Some(pending) = block.as_mut() else {
                    break None;
                };
                pending.extend_from_slice(payload);
                complete = flags & FLAG_END_HEADERS != 0;
            }
            FRAME_GOAWAY => break None,
            _ => {}
        }

        pos = end;
        if complete {
            break block.take();
        }
    };

    let headers = match headers {
        Some(block) => hpack::Decoder::new().decode(&block).unwrap_or_else(|e| {
            tracing::debug!(error = ?e, "undecodable header block");
            Vec::new()
        }),
        None => Vec::new(),
    };

    let (prefix, pending_ack) = match ack_at {
        Some(at) => {
            let mut prefix = BytesMut::with_capacity(buf.len() - FRAME_HEADER_LEN);
            prefix.extend_from_slice(&buf[..at]);
            prefix.extend_from_slice(&buf[at + FRAME_HEADER_LEN..]);
            (prefix.freeze(), None)
        }
        None if settings_sent => {
            let tail = buf.split_off(pos.min(buf.len()));
            (buf.freeze(), Some(tail.freeze()))
        }
        None => (buf.freeze(), None),
    };

    Ok(Sniffed {
        prefix,
        pending_ack,
        http2: true,
        headers,
    })
}

/// Read until `buf` holds `want` bytes; `false` on EOF or past the cap
async fn fill<IO>(io: &mut IO, buf: &mut BytesMut, want: usize) -> io::Result<bool>
where
    IO: AsyncRead + Unpin,
{
    if want > MAX_SNIFF_BYTES {
        return Ok(false);
    }
    while buf.len() < want {
        if io.read_buf(buf).await? == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Length, type and flags of a frame header
pub(crate) fn frame_header(header: &[u8]) -> (usize, u8, u8) {
    let len =
        (usize::from(header[0]) << 16) | (usize::from(header[1]) << 8) | usize::from(header[2]);
    (len, header[3], header[4])
}

/// Header block fragment of a HEADERS payload, without padding and priority
fn header_fragment(payload: &[u8], flags: u8) -> Option<&[u8]> {
    let mut start = 0;
    let mut pad = 0;

    if flags & FLAG_PADDED != 0 {
        pad = usize::from(*payload.first()?);
        start = 1;
    }
    if flags & FLAG_PRIORITY != 0 {
        start += 5;
    }

    let end = payload.len().checked_sub(pad)?;
    payload.get(start..end)
}
