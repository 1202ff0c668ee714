//! Message framing over a byte duplex.
//!
//! A framing turns a raw byte stream into a sequence of whole JSON message
//! bodies and back.  The framing layer knows nothing about JSON-RPC
//! semantics; it only guarantees that each received item is exactly one
//! transmitted message body.  Peers must agree on a framing out of band,
//! there is no negotiation.
//!
//! Every framing is expressed as a [`tokio_util::codec`] encoder/decoder
//! pair so it can be mounted on anything that implements `AsyncRead` +
//! `AsyncWrite` with [`Framed`].
use std::io;
use std::pin::Pin;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Sink, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Content type used by the `lsp` framing.
pub const LSP_CONTENT_TYPE: &str = "application/vscode-jsonrpc; charset=utf-8";

/// Longest length prefix the `decimal` framing will read before giving up.
const MAX_DECIMAL_PREFIX: usize = 20;

/// Error raised by the framing layer.
///
/// Unlike a recoverable JSON error inside a well-delimited frame, any of
/// these means the stream position is no longer trustworthy, so the caller
/// tears the connection down.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("message contains the frame terminator byte {0:#04x}")]
    TerminatorInPayload(u8),
    #[error("message is not a JSON object or array")]
    NotJson,
    #[error("mismatched bracket in JSON message")]
    MismatchedBracket,
    #[error("truncated frame at end of stream")]
    Truncated,
    #[error("invalid length prefix")]
    BadLength,
    #[error("invalid header line")]
    InvalidHeader,
    #[error("missing required content-length")]
    MissingContentLength,
    #[error("invalid content-length: {0}")]
    BadContentLength(String),
    #[error("invalid chunk size line")]
    BadChunkSize,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The supported message framings.  All are symmetric: the same rules apply
/// in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Each message is one complete JSON object or array, recognized by
    /// incremental scanning of the byte stream.
    Raw,
    /// Messages are terminated by LF; the payload must not contain LF.
    Line,
    /// Messages are terminated by NUL; the payload must not contain NUL.
    Nul,
    /// `<ascii-decimal-length>\n<payload>`.
    Decimal,
    /// `<unsigned-LEB128-length><payload>`.
    Varint,
    /// HTTP-style headers with a mandatory `Content-Length`, a blank line,
    /// then the payload.  The string is the `Content-Type` sent with each
    /// message; received headers other than `Content-Length` are ignored.
    Header(String),
    /// HTTP-chunked-style framing: a hex length line, that many payload
    /// bytes, CRLF, repeated until a zero-length chunk.
    Chunked,
}

impl Framing {
    /// Resolve a framing from its configuration name.
    ///
    /// The names understood are:
    ///
    ///    chunked    -- corresponds to [`Framing::Chunked`]
    ///    decimal    -- corresponds to [`Framing::Decimal`]
    ///    header:<t> -- corresponds to [`Framing::Header`] with content type `<t>`
    ///    line       -- corresponds to [`Framing::Line`]
    ///    lsp        -- header framing with the LSP content type
    ///    nul        -- corresponds to [`Framing::Nul`]
    ///    raw        -- corresponds to [`Framing::Raw`]
    ///    varint     -- corresponds to [`Framing::Varint`]
    pub fn from_name(name: &str) -> Option<Framing> {
        if let Some(t) = name.strip_prefix("header:") {
            return Some(Framing::Header(t.to_string()));
        }
        match name {
            "raw" => Some(Framing::Raw),
            "line" => Some(Framing::Line),
            "nul" => Some(Framing::Nul),
            "decimal" => Some(Framing::Decimal),
            "varint" => Some(Framing::Varint),
            "lsp" => Some(Framing::Header(LSP_CONTENT_TYPE.to_string())),
            "chunked" => Some(Framing::Chunked),
            _ => None,
        }
    }

    /// A fresh codec instance for this framing.
    pub fn codec(&self) -> FramingCodec {
        FramingCodec {
            framing: self.clone(),
            content_length: None,
            header_body: None,
        }
    }

    /// Mount this framing on a byte duplex, yielding a channel of whole
    /// message bodies.
    pub fn channel<T>(&self, stream: T) -> Channel<T>
    where
        T: AsyncRead + AsyncWrite,
    {
        Framed::new(stream, self.codec())
    }
}

/// A byte duplex with a framing mounted on it: a `Sink`/`Stream` of whole
/// message bodies.
pub type Channel<T> = Framed<T, FramingCodec>;

pub(crate) type MessageSink = Pin<Box<dyn Sink<Bytes, Error = FrameError> + Send>>;
pub(crate) type MessageStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, FrameError>> + Send>>;

/// Mount `framing` on `stream` and split it into independently owned write
/// and read halves, erasing the stream type.
pub(crate) fn split<T>(stream: T, framing: &Framing) -> (MessageSink, MessageStream)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, source) = framing.channel(stream).split();
    (Box::pin(sink), Box::pin(source))
}

/// Codec implementing one [`Framing`] as a [`Decoder`]/[`Encoder`] pair.
pub struct FramingCodec {
    framing: Framing,
    /// Header framing: content-length seen among the current header lines.
    content_length: Option<usize>,
    /// Header framing: body length once the blank line has been consumed.
    header_body: Option<usize>,
}

impl Decoder for FramingCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match &self.framing {
            Framing::Raw => decode_raw(src),
            Framing::Line => Ok(decode_terminated(src, b'\n')),
            Framing::Nul => Ok(decode_terminated(src, b'\0')),
            Framing::Decimal => decode_decimal(src),
            Framing::Varint => decode_varint(src),
            Framing::Header(_) => self.decode_header(src),
            Framing::Chunked => decode_chunked(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.header_body.is_none() && self.content_length.is_none() => {
                Ok(None)
            }
            None => Err(FrameError::Truncated),
        }
    }
}

impl Encoder<Bytes> for FramingCodec {
    type Error = FrameError;

    fn encode(&mut self, msg: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        match &self.framing {
            Framing::Raw => dst.extend_from_slice(&msg),
            Framing::Line => {
                if msg.contains(&b'\n') {
                    return Err(FrameError::TerminatorInPayload(b'\n'));
                }
                dst.reserve(msg.len() + 1);
                dst.extend_from_slice(&msg);
                dst.put_u8(b'\n');
            }
            Framing::Nul => {
                if msg.contains(&b'\0') {
                    return Err(FrameError::TerminatorInPayload(b'\0'));
                }
                dst.reserve(msg.len() + 1);
                dst.extend_from_slice(&msg);
                dst.put_u8(b'\0');
            }
            Framing::Decimal => {
                dst.extend_from_slice(format!("{}\n", msg.len()).as_bytes());
                dst.extend_from_slice(&msg);
            }
            Framing::Varint => {
                put_varint(msg.len() as u64, dst);
                dst.extend_from_slice(&msg);
            }
            Framing::Header(content_type) => {
                dst.extend_from_slice(
                    format!(
                        "Content-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
                        msg.len()
                    )
                    .as_bytes(),
                );
                dst.extend_from_slice(&msg);
            }
            Framing::Chunked => {
                if !msg.is_empty() {
                    dst.extend_from_slice(format!("{:x}\r\n", msg.len()).as_bytes());
                    dst.extend_from_slice(&msg);
                    dst.extend_from_slice(b"\r\n");
                }
                dst.extend_from_slice(b"0\r\n\r\n");
            }
        }
        Ok(())
    }
}

impl FramingCodec {
    /// Header framing: consume header lines as they become available, then
    /// the body once `Content-Length` is known.
    fn decode_header(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        loop {
            if let Some(len) = self.header_body {
                if src.len() < len {
                    src.reserve(len - src.len());
                    return Ok(None);
                }
                self.header_body = None;
                return Ok(Some(src.split_to(len).freeze()));
            }

            let Some(nl) = src.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let line = src.split_to(nl + 1);
            let line = trim_line(&line[..nl]);

            if line.is_empty() {
                // Blank line ends the headers.
                let len = self
                    .content_length
                    .take()
                    .ok_or(FrameError::MissingContentLength)?;
                self.header_body = Some(len);
                continue;
            }

            let Some(colon) = line.iter().position(|&b| b == b':') else {
                return Err(FrameError::InvalidHeader);
            };
            let key = line[..colon].trim_ascii();
            let value = line[colon + 1..].trim_ascii();
            if key.eq_ignore_ascii_case(b"content-length") {
                let text = String::from_utf8_lossy(value).into_owned();
                let parsed: i64 = text
                    .parse()
                    .map_err(|_| FrameError::BadContentLength(text.clone()))?;
                let len =
                    usize::try_from(parsed).map_err(|_| FrameError::BadContentLength(text))?;
                self.content_length = Some(len);
            }
            // Unknown headers are ignored.
        }
    }
}

/// Strip one trailing CR, so both CRLF and bare LF line endings work.
fn trim_line(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Scan off one complete JSON object or array.
///
/// Keeps a stack of open braces/brackets with string and escape awareness;
/// a closer of the wrong type is a framing error, since the decoder cannot
/// find a trustworthy message boundary in such a stream.  The bytes are not
/// otherwise validated (the JSON parser upstack does that).
fn decode_raw(src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
    // Consume inter-message whitespace so it never lingers in the buffer.
    while src.first().is_some_and(u8::is_ascii_whitespace) {
        src.advance(1);
    }
    let Some(&first) = src.first() else {
        return Ok(None);
    };
    if first != b'{' && first != b'[' {
        return Err(FrameError::NotJson);
    }

    let mut open: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in src.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => open.push(b),
            b'}' | b']' => {
                let opener = if b == b'}' { b'{' } else { b'[' };
                if open.pop() != Some(opener) {
                    return Err(FrameError::MismatchedBracket);
                }
                if open.is_empty() {
                    return Ok(Some(src.split_to(i + 1).freeze()));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

fn decode_terminated(src: &mut BytesMut, terminator: u8) -> Option<Bytes> {
    let pos = src.iter().position(|&b| b == terminator)?;
    let frame = src.split_to(pos).freeze();
    src.advance(1);
    Some(frame)
}

fn decode_decimal(src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
    let Some(nl) = src.iter().position(|&b| b == b'\n') else {
        if src.len() > MAX_DECIMAL_PREFIX {
            return Err(FrameError::BadLength);
        }
        return Ok(None);
    };
    let digits = &src[..nl];
    if digits.is_empty() || nl > MAX_DECIMAL_PREFIX || !digits.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::BadLength);
    }
    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(FrameError::BadLength)?;
    if src.len() < nl + 1 + len {
        src.reserve(nl + 1 + len - src.len());
        return Ok(None);
    }
    src.advance(nl + 1);
    Ok(Some(src.split_to(len).freeze()))
}

fn decode_varint(src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
    let mut len = 0u64;
    let mut shift = 0u32;
    let mut used = 0usize;
    for (i, &b) in src.iter().enumerate() {
        let part = u64::from(b & 0x7f);
        if shift >= 64 || (shift == 63 && part > 1) {
            return Err(FrameError::BadLength);
        }
        len |= part << shift;
        if b & 0x80 == 0 {
            used = i + 1;
            break;
        }
        shift += 7;
    }
    if used == 0 {
        // Continuation bit still set at the end of the buffer.
        return Ok(None);
    }
    let len = usize::try_from(len).map_err(|_| FrameError::BadLength)?;
    if src.len() < used + len {
        src.reserve(used + len - src.len());
        return Ok(None);
    }
    src.advance(used);
    Ok(Some(src.split_to(len).freeze()))
}

fn put_varint(mut n: u64, dst: &mut BytesMut) {
    loop {
        let mut b = (n & 0x7f) as u8;
        n >>= 7;
        if n != 0 {
            b |= 0x80;
        }
        dst.put_u8(b);
        if n == 0 {
            break;
        }
    }
}

/// Reassemble one chunked message.
///
/// Scans the whole message without consuming anything so partial arrivals
/// just wait for more bytes; only a complete message advances the buffer.
fn decode_chunked(src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
    let mut pos = 0usize;
    let mut spans: Vec<(usize, usize)> = Vec::new();

    loop {
        let Some(nl) = src[pos..].iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let size = parse_hex(trim_line(&src[pos..pos + nl]))?;
        pos += nl + 1;

        if size == 0 {
            // The zero chunk is followed by one final blank line.
            let Some(nl) = src[pos..].iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            if !trim_line(&src[pos..pos + nl]).is_empty() {
                return Err(FrameError::BadChunkSize);
            }
            pos += nl + 1;

            let total = spans.iter().map(|&(_, len)| len).sum();
            let mut out = BytesMut::with_capacity(total);
            for &(start, len) in &spans {
                out.extend_from_slice(&src[start..start + len]);
            }
            src.advance(pos);
            return Ok(Some(out.freeze()));
        }

        if src.len() < pos + size {
            return Ok(None);
        }
        spans.push((pos, size));
        pos += size;

        // Chunk data is followed by CRLF (or a bare LF).
        match src.get(pos) {
            None => return Ok(None),
            Some(b'\n') => pos += 1,
            Some(b'\r') => match src.get(pos + 1) {
                None => return Ok(None),
                Some(b'\n') => pos += 2,
                Some(_) => return Err(FrameError::BadChunkSize),
            },
            Some(_) => return Err(FrameError::BadChunkSize),
        }
    }
}

fn parse_hex(line: &[u8]) -> Result<usize, FrameError> {
    if line.is_empty() || !line.iter().all(u8::is_ascii_hexdigit) {
        return Err(FrameError::BadChunkSize);
    }
    let text = std::str::from_utf8(line).map_err(|_| FrameError::BadChunkSize)?;
    usize::from_str_radix(text, 16).map_err(|_| FrameError::BadChunkSize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::SinkExt;

    fn all_framings() -> Vec<Framing> {
        vec![
            Framing::Raw,
            Framing::Line,
            Framing::Nul,
            Framing::Decimal,
            Framing::Varint,
            Framing::Header("application/json".to_string()),
            Framing::Chunked,
        ]
    }

    /// Encode all messages, then decode them back two ways: from the whole
    /// wire buffer, and dribbled in one byte at a time to exercise the
    /// partial-frame paths.
    fn round_trip(framing: &Framing, messages: &[&[u8]]) {
        let mut tx = framing.codec();
        let mut wire = BytesMut::new();
        for msg in messages {
            tx.encode(Bytes::copy_from_slice(msg), &mut wire).unwrap();
        }

        let mut rx = framing.codec();
        let mut buf = wire.clone();
        for msg in messages {
            let frame = rx.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&frame[..], *msg, "framing {framing:?}");
        }
        assert!(rx.decode_eof(&mut buf).unwrap().is_none());

        let mut rx = framing.codec();
        let mut buf = BytesMut::new();
        let mut decoded: Vec<Bytes> = Vec::new();
        for &byte in wire.iter() {
            buf.put_u8(byte);
            while let Some(frame) = rx.decode(&mut buf).unwrap() {
                decoded.push(frame);
            }
        }
        assert_eq!(decoded.len(), messages.len(), "framing {framing:?}");
        for (frame, msg) in decoded.iter().zip(messages) {
            assert_eq!(&frame[..], *msg);
        }
    }

    #[test]
    fn test_round_trip_json_messages() {
        let small: &[u8] = br#"{"jsonrpc":"2.0","id":1,"method":"add","params":[2,3]}"#;
        let tricky: &[u8] = br#"{"s":"quote \" and }] inside","a":[1,[2,{"b":"\\"}]]}"#;
        let batch: &[u8] = br#"[{"jsonrpc":"2.0","method":"log","params":["hi"]}]"#;
        for framing in all_framings() {
            round_trip(&framing, &[small, tricky, batch]);
        }
    }

    #[test]
    fn test_round_trip_large_message() {
        let large = format!(r#"{{"data":"{}"}}"#, "x".repeat(256 * 1024));
        for framing in all_framings() {
            round_trip(&framing, &[large.as_bytes()]);
        }
    }

    #[test]
    fn test_round_trip_empty_and_arbitrary_bytes() {
        // The length-delimited framings carry any payload, including empty.
        for framing in [
            Framing::Decimal,
            Framing::Varint,
            Framing::Header("application/json".to_string()),
            Framing::Chunked,
        ] {
            round_trip(&framing, &[b"" as &[u8], b"\x00\x01\xff\n\r\n", b"plain text"]);
        }
        // The terminator framings carry anything that avoids their byte.
        round_trip(&Framing::Line, &[b"" as &[u8], b"no newline here\r"]);
        round_trip(&Framing::Nul, &[b"" as &[u8], b"line\nbreaks\nallowed"]);
    }

    #[test]
    fn test_terminator_in_payload_rejected() {
        let mut codec = Framing::Line.codec();
        let mut dst = BytesMut::new();
        let err = codec.encode(Bytes::from_static(b"a\nb"), &mut dst).unwrap_err();
        assert_matches!(err, FrameError::TerminatorInPayload(b'\n'));

        let mut codec = Framing::Nul.codec();
        let err = codec.encode(Bytes::from_static(b"a\0b"), &mut dst).unwrap_err();
        assert_matches!(err, FrameError::TerminatorInPayload(0));
    }

    #[test]
    fn test_raw_scans_whitespace_and_scalars() {
        let mut codec = Framing::Raw.codec();

        let mut buf = BytesMut::from(&b"  \n{\"a\":1} [2,3]"[..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"{\"a\":1}");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"[2,3]");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());

        // A top-level scalar is not a frameable message.
        let mut buf = BytesMut::from(&b"not json at all"[..]);
        assert_matches!(codec.decode(&mut buf), Err(FrameError::NotJson));
    }

    #[test]
    fn test_raw_rejects_mismatched_brackets() {
        // A closer of the wrong type is a framing error, not a frame that
        // happens to hold bad JSON.
        let mut codec = Framing::Raw.codec();
        let mut buf = BytesMut::from(&b"{]"[..]);
        assert_matches!(codec.decode(&mut buf), Err(FrameError::MismatchedBracket));

        let mut codec = Framing::Raw.codec();
        let mut buf = BytesMut::from(&b"[}"[..]);
        assert_matches!(codec.decode(&mut buf), Err(FrameError::MismatchedBracket));

        // Mismatches below the top level are caught too.
        let mut codec = Framing::Raw.codec();
        let mut buf = BytesMut::from(&br#"{"a":[1,2}}"#[..]);
        assert_matches!(codec.decode(&mut buf), Err(FrameError::MismatchedBracket));

        // Bracket characters inside strings do not participate.
        let mut codec = Framing::Raw.codec();
        let mut buf = BytesMut::from(&br#"{"a":"]}"}"#[..]);
        assert_eq!(
            &codec.decode(&mut buf).unwrap().unwrap()[..],
            br#"{"a":"]}"}"#
        );
    }

    #[test]
    fn test_raw_incomplete_at_eof() {
        let mut codec = Framing::Raw.codec();
        let mut buf = BytesMut::from(&br#"{"unterminated":["#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_matches!(codec.decode_eof(&mut buf), Err(FrameError::Truncated));
    }

    #[test]
    fn test_header_parsing_rules() {
        // Case-insensitive content-length, LF-only endings, extra headers ignored.
        let mut codec = Framing::Header("application/json".to_string()).codec();
        let mut buf = BytesMut::from(&b"X-Extra: yes\ncontent-LENGTH: 2\n\nhi"[..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"hi");

        // Missing content-length.
        let mut codec = Framing::Header("t".to_string()).codec();
        let mut buf = BytesMut::from(&b"Content-Type: t\r\n\r\n"[..]);
        assert_matches!(codec.decode(&mut buf), Err(FrameError::MissingContentLength));

        // A header line without a colon.
        let mut codec = Framing::Header("t".to_string()).codec();
        let mut buf = BytesMut::from(&b"garbage line\r\n\r\n"[..]);
        assert_matches!(codec.decode(&mut buf), Err(FrameError::InvalidHeader));

        // Negative and non-integer lengths.
        let mut codec = Framing::Header("t".to_string()).codec();
        let mut buf = BytesMut::from(&b"Content-Length: -1\r\n\r\n"[..]);
        assert_matches!(codec.decode(&mut buf), Err(FrameError::BadContentLength(_)));

        let mut codec = Framing::Header("t".to_string()).codec();
        let mut buf = BytesMut::from(&b"Content-Length: ten\r\n\r\n"[..]);
        assert_matches!(codec.decode(&mut buf), Err(FrameError::BadContentLength(_)));
    }

    #[test]
    fn test_header_send_includes_content_type() {
        let mut codec = Framing::Header("application/json".to_string()).codec();
        let mut wire = BytesMut::new();
        codec.encode(Bytes::from_static(b"{}"), &mut wire).unwrap();
        let text = String::from_utf8(wire.to_vec()).unwrap();
        assert!(text.starts_with("Content-Type: application/json\r\nContent-Length: 2\r\n\r\n{}"));
    }

    #[test]
    fn test_chunked_multi_chunk_reassembly() {
        // A peer may split the payload across chunks however it likes.
        let mut codec = Framing::Chunked.codec();
        let mut buf = BytesMut::from(&b"3\r\nhel\r\n2\r\nlo\r\n0\r\n\r\n"[..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"hello");
        assert!(buf.is_empty());

        // LF-only line endings are tolerated.
        let mut buf = BytesMut::from(&b"5\nhello\n0\n\n"[..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"hello");
    }

    #[test]
    fn test_chunked_bad_size_line() {
        let mut codec = Framing::Chunked.codec();
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert_matches!(codec.decode(&mut buf), Err(FrameError::BadChunkSize));
    }

    #[test]
    fn test_varint_length_bytes() {
        let mut wire = BytesMut::new();
        put_varint(300, &mut wire);
        assert_eq!(&wire[..], &[0xac, 0x02]);

        let mut codec = Framing::Varint.codec();
        let payload = vec![b'x'; 300];
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire);
        buf.extend_from_slice(&payload);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], &payload[..]);
    }

    #[test]
    fn test_decimal_rejects_bad_prefix() {
        let mut codec = Framing::Decimal.codec();
        let mut buf = BytesMut::from(&b"12x\nhello"[..]);
        assert_matches!(codec.decode(&mut buf), Err(FrameError::BadLength));

        let mut codec = Framing::Decimal.codec();
        let mut buf = BytesMut::from(&b"999999999999999999999999"[..]);
        assert_matches!(codec.decode(&mut buf), Err(FrameError::BadLength));
    }

    #[test]
    fn test_framing_name_catalog() {
        assert_eq!(Framing::from_name("raw"), Some(Framing::Raw));
        assert_eq!(Framing::from_name("line"), Some(Framing::Line));
        assert_eq!(Framing::from_name("nul"), Some(Framing::Nul));
        assert_eq!(Framing::from_name("decimal"), Some(Framing::Decimal));
        assert_eq!(Framing::from_name("varint"), Some(Framing::Varint));
        assert_eq!(Framing::from_name("chunked"), Some(Framing::Chunked));
        assert_eq!(
            Framing::from_name("lsp"),
            Some(Framing::Header(LSP_CONTENT_TYPE.to_string()))
        );
        assert_eq!(
            Framing::from_name("header:text/plain"),
            Some(Framing::Header("text/plain".to_string()))
        );
        assert_eq!(Framing::from_name("telepathy"), None);
    }

    #[tokio::test]
    async fn test_channel_over_duplex() {
        let framing = Framing::from_name("lsp").unwrap();
        let (near, far) = tokio::io::duplex(4096);
        let mut near = framing.channel(near);
        let mut far = framing.channel(far);

        let msg = Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        near.send(msg.clone()).await.unwrap();
        let received = far.next().await.unwrap().unwrap();
        assert_eq!(received, msg);

        let reply = Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#);
        far.send(reply.clone()).await.unwrap();
        let received = near.next().await.unwrap().unwrap();
        assert_eq!(received, reply);

        // Dropping both halves closes the duplex; the peer sees a clean EOF.
        drop(near);
        assert!(far.next().await.is_none());
    }
}
