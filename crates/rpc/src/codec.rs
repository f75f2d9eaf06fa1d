//! Frame codecs for the duplex channel.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CodecError;

/// How envelopes are delimited on the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
	/// `Content-Length: N\r\n\r\n` header followed by `N` bytes of JSON (LSP stdio).
	#[default]
	ContentLength,
	/// One JSON document per line.
	Newline,
}

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Read one frame body.
///
/// Returns `Ok(None)` on a clean EOF between frames. `buf` is scratch space
/// reused across calls. Bodies are returned as raw bytes; whether they are
/// valid UTF-8 or JSON is for the decoder to judge.
///
/// # Errors
///
/// Returns [`CodecError`] on I/O failure, EOF inside a frame, bad headers, or
/// a body larger than [`MAX_FRAME_LEN`].
pub async fn read_frame(
	reader: &mut (impl AsyncBufRead + Unpin),
	framing: Framing,
	buf: &mut Vec<u8>,
) -> Result<Option<Vec<u8>>, CodecError> {
	match framing {
		Framing::ContentLength => read_content_length(reader, buf).await,
		Framing::Newline => read_line_frame(reader, buf).await,
	}
}

async fn read_content_length(
	reader: &mut (impl AsyncBufRead + Unpin),
	buf: &mut Vec<u8>,
) -> Result<Option<Vec<u8>>, CodecError> {
	let mut content_length: Option<usize> = None;
	let mut saw_header = false;
	loop {
		buf.clear();
		if reader.read_until(b'\n', buf).await? == 0 {
			if saw_header {
				return Err(CodecError::Io(std::io::ErrorKind::UnexpectedEof.into()));
			}
			return Ok(None);
		}

		let line = String::from_utf8_lossy(buf);
		let line = line.trim();
		if line.is_empty() {
			if saw_header {
				break;
			}
			continue;
		}
		saw_header = true;

		let Some((name, value)) = line.split_once(':') else {
			return Err(CodecError::InvalidHeader(line.to_string()));
		};
		if name.trim().eq_ignore_ascii_case("content-length") {
			let len = value
				.trim()
				.parse()
				.map_err(|_| CodecError::InvalidHeader(line.to_string()))?;
			content_length = Some(len);
		}
	}

	let length = content_length.ok_or(CodecError::MissingContentLength)?;
	if length > MAX_FRAME_LEN {
		return Err(CodecError::FrameTooLarge {
			length,
			limit: MAX_FRAME_LEN,
		});
	}
	let mut body = vec![0u8; length];
	reader.read_exact(&mut body).await?;
	Ok(Some(body))
}

async fn read_line_frame(
	reader: &mut (impl AsyncBufRead + Unpin),
	buf: &mut Vec<u8>,
) -> Result<Option<Vec<u8>>, CodecError> {
	loop {
		buf.clear();
		let limit = (MAX_FRAME_LEN + 1) as u64;
		let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
		if read == 0 {
			return Ok(None);
		}
		if buf.last() != Some(&b'\n') && read as u64 == limit {
			return Err(CodecError::FrameTooLarge {
				length: read,
				limit: MAX_FRAME_LEN,
			});
		}
		let line = buf.trim_ascii();
		if !line.is_empty() {
			return Ok(Some(line.to_vec()));
		}
	}
}

/// Write one frame body and flush.
///
/// # Errors
///
/// Returns [`CodecError::Io`] when the channel rejects the write.
pub async fn write_frame(
	writer: &mut (impl AsyncWrite + Unpin),
	framing: Framing,
	body: &[u8],
) -> Result<(), CodecError> {
	match framing {
		Framing::ContentLength => {
			let header = format!("Content-Length: {}\r\n\r\n", body.len());
			writer.write_all(header.as_bytes()).await?;
			writer.write_all(body).await?;
		}
		Framing::Newline => {
			writer.write_all(body).await?;
			writer.write_all(b"\n").await?;
		}
	}
	writer.flush().await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use tokio::io::BufReader;

	use super::*;

	#[tokio::test(flavor = "current_thread")]
	async fn reads_consecutive_content_length_frames() {
		let input = b"Content-Length: 7\r\n\r\n{\"a\":1}Content-Type: application/vscode-jsonrpc\r\ncontent-length: 2\r\n\r\n{}";
		let mut reader = BufReader::new(&input[..]);
		let mut buf = Vec::new();

		let first = read_frame(&mut reader, Framing::ContentLength, &mut buf).await.unwrap();
		assert_eq!(first.as_deref(), Some(&b"{\"a\":1}"[..]));
		let second = read_frame(&mut reader, Framing::ContentLength, &mut buf).await.unwrap();
		assert_eq!(second.as_deref(), Some(&b"{}"[..]));
		let eof = read_frame(&mut reader, Framing::ContentLength, &mut buf).await.unwrap();
		assert!(eof.is_none());
	}

	#[tokio::test(flavor = "current_thread")]
	async fn missing_length_is_an_error() {
		let input = b"Content-Type: x\r\n\r\n{}";
		let mut reader = BufReader::new(&input[..]);
		let mut buf = Vec::new();
		let err = read_frame(&mut reader, Framing::ContentLength, &mut buf).await.unwrap_err();
		assert!(matches!(err, CodecError::MissingContentLength));
	}

	#[tokio::test(flavor = "current_thread")]
	async fn truncated_headers_are_unexpected_eof() {
		let input = b"Content-Length: 10\r\n";
		let mut reader = BufReader::new(&input[..]);
		let mut buf = Vec::new();
		let err = read_frame(&mut reader, Framing::ContentLength, &mut buf).await.unwrap_err();
		assert!(matches!(err, CodecError::Io(_)));
	}

	#[tokio::test(flavor = "current_thread")]
	async fn newline_framing_skips_blank_lines() {
		let input = b"{\"x\":1}\n\n{\"y\":2}\n";
		let mut reader = BufReader::new(&input[..]);
		let mut buf = Vec::new();

		let a = read_frame(&mut reader, Framing::Newline, &mut buf).await.unwrap();
		let b = read_frame(&mut reader, Framing::Newline, &mut buf).await.unwrap();
		let c = read_frame(&mut reader, Framing::Newline, &mut buf).await.unwrap();
		assert_eq!(a.as_deref(), Some(&b"{\"x\":1}"[..]));
		assert_eq!(b.as_deref(), Some(&b"{\"y\":2}"[..]));
		assert!(c.is_none());
	}

	#[tokio::test(flavor = "current_thread")]
	async fn invalid_utf8_lines_are_returned_as_bytes() {
		let input = b"{\"params\":\"\xff\"}\n{\"ok\":true}\n";
		let mut reader = BufReader::new(&input[..]);
		let mut buf = Vec::new();

		let bad = read_frame(&mut reader, Framing::Newline, &mut buf).await.unwrap();
		assert_eq!(bad.as_deref(), Some(&b"{\"params\":\"\xff\"}"[..]));
		let good = read_frame(&mut reader, Framing::Newline, &mut buf).await.unwrap();
		assert_eq!(good.as_deref(), Some(&b"{\"ok\":true}"[..]));
	}

	#[tokio::test(flavor = "current_thread")]
	async fn oversized_content_length_is_refused_before_reading() {
		let input = format!("Content-Length: {}\r\n\r\n{{}}", MAX_FRAME_LEN + 1);
		let mut reader = BufReader::new(input.as_bytes());
		let mut buf = Vec::new();
		let err = read_frame(&mut reader, Framing::ContentLength, &mut buf).await.unwrap_err();
		assert!(matches!(err, CodecError::FrameTooLarge { length, .. } if length == MAX_FRAME_LEN + 1));
	}

	#[tokio::test(flavor = "current_thread")]
	async fn written_frames_read_back() {
		let mut out = Vec::new();
		write_frame(&mut out, Framing::ContentLength, b"{\"id\":1}").await.unwrap();
		assert_eq!(out, b"Content-Length: 8\r\n\r\n{\"id\":1}");

		let mut out = Vec::new();
		write_frame(&mut out, Framing::Newline, b"{}").await.unwrap();
		assert_eq!(out, b"{}\n");
	}
}
