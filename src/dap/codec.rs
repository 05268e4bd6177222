//! DAP wire protocol codec
//!
//! The DAP protocol uses HTTP-style headers followed by JSON body:
//! ```text
//! Content-Length: <byte-length>\r\n
//! Content-Type: application/vscode-jsonrpc; charset=utf-8\r\n   (optional)
//! \r\n
//! <JSON body>
//! ```
//!
//! Bytes may arrive in any slicing. [`FrameDecoder`] buffers them and hands
//! out each complete frame exactly once, keeping whatever follows it for the
//! next call.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::Error;

/// Charset assumed when no `Content-Type` header names one
pub const DEFAULT_CHARSET: &str = "utf-8";

/// 100MB should be plenty for any DAP message
const MAX_CONTENT_LENGTH: usize = 100 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// One complete message body plus the charset its header declared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub body: Vec<u8>,
    pub charset: String,
}

impl Frame {
    /// Decode the body into text according to the declared charset
    pub fn text(&self) -> Result<&str, Error> {
        match self.charset.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => std::str::from_utf8(&self.body)
                .map_err(|e| Error::DapProtocol(format!("Invalid UTF-8: {}", e))),
            "ascii" | "us-ascii" if self.body.is_ascii() => std::str::from_utf8(&self.body)
                .map_err(|e| Error::DapProtocol(format!("Invalid ASCII: {}", e))),
            _ => Err(Error::UnsupportedCharset(self.charset.clone())),
        }
    }
}

/// Incremental decoder for header-framed messages
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

struct Header {
    content_length: usize,
    charset: Option<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the stream
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes held that don't form a complete frame yet
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame out of the buffer
    ///
    /// Returns `Ok(None)` when more bytes are needed. A header block that
    /// can't be parsed is discarded before the error is returned so the
    /// stream can resynchronize on the next message.
    pub fn decode(&mut self) -> Result<Option<Frame>, Error> {
        let Some(header_end) = find(&self.buf, HEADER_TERMINATOR) else {
            return Ok(None);
        };
        let body_start = header_end + HEADER_TERMINATOR.len();

        let header = match parse_header(&self.buf[..header_end]) {
            Ok(header) => header,
            Err(e) => {
                self.buf.drain(..body_start);
                return Err(e);
            }
        };

        let body_end = body_start + header.content_length;
        if self.buf.len() < body_end {
            return Ok(None);
        }

        let body = self.buf[body_start..body_end].to_vec();
        self.buf.drain(..body_end);

        Ok(Some(Frame {
            body,
            charset: header
                .charset
                .unwrap_or_else(|| DEFAULT_CHARSET.to_string()),
        }))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_header(raw: &[u8]) -> Result<Header, Error> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::DapProtocol("Header block is not valid ASCII".to_string()))?;

    let mut content_length: Option<usize> = None;
    let mut charset = None;

    for line in text.split("\r\n") {
        // Lines that aren't `Key: value` are tolerated and skipped
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        if key.trim().eq_ignore_ascii_case("Content-Length") {
            let len = value.parse().map_err(|_| {
                Error::DapProtocol(format!("Invalid Content-Length: {}", value))
            })?;
            content_length = Some(len);
        } else if key.trim().eq_ignore_ascii_case("Content-Type") {
            charset = value
                .split(';')
                .skip(1)
                .filter_map(|param| param.trim().split_once('='))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("charset"))
                .map(|(_, cs)| cs.trim().trim_matches('"').to_string());
        }
    }

    let content_length = content_length
        .ok_or_else(|| Error::DapProtocol("Missing Content-Length header".to_string()))?;

    if content_length > MAX_CONTENT_LENGTH {
        return Err(Error::DapProtocol(format!(
            "Content-Length too large: {} bytes",
            content_length
        )));
    }

    Ok(Header {
        content_length,
        charset,
    })
}

/// Reads frames off an async byte stream
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; 8192],
        }
    }

    /// Read the next frame
    ///
    /// Returns `Ok(None)` once the stream has ended.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            if let Some(frame) = self.decoder.decode()? {
                return Ok(Some(frame));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    tracing::warn!(
                        bytes = self.decoder.buffered(),
                        "Stream ended inside an incomplete message"
                    );
                }
                return Ok(None);
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }
}

/// Serialize a JSON body into a complete wire message
pub fn encode_message(json: &str) -> Vec<u8> {
    // `str::len` is the UTF-8 byte length, which is what the header counts
    let mut out = format!("Content-Length: {}\r\n\r\n", json.len()).into_bytes();
    out.extend_from_slice(json.as_bytes());
    out
}

/// Write a DAP message to the stream
///
/// Adds the Content-Length header and writes the JSON body
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> Result<(), Error> {
    writer.write_all(&encode_message(json)).await?;
    writer.flush().await?;

    Ok(())
}
