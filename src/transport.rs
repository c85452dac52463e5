// src/transport.rs

//! Private byte-stream channel between the host and the transfer agent.
//!
//! Every frame is one compact JSON object followed by a NUL byte. The decoder
//! also accepts `\n` as a terminator and skips blank frames, so an agent that
//! writes newline-delimited JSON works too. Reads are buffered until a
//! terminator arrives; one `read()` is never assumed to be one message.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

pub const FRAME_TERMINATOR: u8 = 0x00;
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
    #[error("timed out waiting for the agent to connect")]
    ConnectTimeout,
}

/// Splits a byte stream on NUL / newline terminators.
#[derive(Debug, Default, Clone)]
pub struct FrameCodec {
    /// Where the terminator search resumes, so a partial frame is scanned once.
    next_index: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, TransportError> {
        loop {
            let search_from = self.next_index.min(buf.len());
            let found = buf[search_from..]
                .iter()
                .position(|b| *b == FRAME_TERMINATOR || *b == b'\n');

            let Some(offset) = found else {
                if buf.len() > MAX_FRAME_LEN {
                    buf.clear();
                    self.next_index = 0;
                    return Err(TransportError::FrameTooLarge(MAX_FRAME_LEN));
                }
                self.next_index = buf.len();
                return Ok(None);
            };

            let end = search_from + offset;
            self.next_index = 0;
            let mut frame = buf.split_to(end + 1);
            frame.truncate(end);
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(frame));
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        if item.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(MAX_FRAME_LEN));
        }
        dst.reserve(item.len() + 1);
        dst.put_slice(&item);
        dst.put_u8(FRAME_TERMINATOR);
        Ok(())
    }
}

pub fn encode_frame<T: Serialize>(message: &T) -> Result<Bytes, TransportError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, TransportError> {
    Ok(serde_json::from_slice(frame)?)
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type FrameReader = FramedRead<BoxedReader, FrameCodec>;
pub type FrameWriter = FramedWrite<BoxedWriter, FrameCodec>;

/// A connected pair of unidirectional streams.
pub struct Channel {
    /// Frames sent by the agent (response pipe).
    pub reader: FrameReader,
    /// Frames sent to the agent (request pipe).
    pub writer: FrameWriter,
}

impl Channel {
    pub fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: FramedRead::new(reader, FrameCodec::new()),
            writer: FramedWrite::new(writer, FrameCodec::new()),
        }
    }
}

/// The two private endpoints the agent connects to. Both exist before the
/// agent is spawned.
pub struct PipeEndpoints {
    request_path: PathBuf,
    response_path: PathBuf,
    inner: platform::Listeners,
}

impl PipeEndpoints {
    pub fn create(dir: &Path, tag: &str) -> Result<Self, TransportError> {
        let (request_path, response_path) = platform::endpoint_paths(dir, tag);
        let inner = platform::Listeners::bind(&request_path, &response_path)?;
        Ok(Self { request_path, response_path, inner })
    }

    pub fn request_path(&self) -> &Path {
        &self.request_path
    }

    pub fn response_path(&self) -> &Path {
        &self.response_path
    }

    /// Waits until the agent has connected to both endpoints.
    pub async fn accept(self, timeout: Duration) -> Result<Channel, TransportError> {
        let accepted = tokio::time::timeout(timeout, self.inner.accept()).await;
        platform::cleanup(&self.request_path, &self.response_path);
        match accepted {
            Ok(result) => {
                let (reader, writer) = result?;
                Ok(Channel::new(reader, writer))
            }
            Err(_) => Err(TransportError::ConnectTimeout),
        }
    }
}

#[cfg(unix)]
mod platform {
    use super::{BoxedReader, BoxedWriter, TransportError};
    use std::path::{Path, PathBuf};
    use tokio::net::UnixListener;

    pub fn endpoint_paths(dir: &Path, tag: &str) -> (PathBuf, PathBuf) {
        let pid = std::process::id();
        (
            dir.join(format!("gamedl-{tag}-{pid}-req.sock")),
            dir.join(format!("gamedl-{tag}-{pid}-res.sock")),
        )
    }

    pub struct Listeners {
        request: UnixListener,
        response: UnixListener,
    }

    impl Listeners {
        pub fn bind(request: &Path, response: &Path) -> Result<Self, TransportError> {
            // Leftovers from a crashed run would make bind fail.
            cleanup(request, response);
            Ok(Self {
                request: UnixListener::bind(request)?,
                response: UnixListener::bind(response)?,
            })
        }

        pub async fn accept(&self) -> Result<(BoxedReader, BoxedWriter), TransportError> {
            let ((request, _), (response, _)) =
                tokio::try_join!(self.request.accept(), self.response.accept())?;
            let (_, writer) = request.into_split();
            let (reader, _) = response.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
    }

    pub fn cleanup(request: &Path, response: &Path) {
        let _ = std::fs::remove_file(request);
        let _ = std::fs::remove_file(response);
    }
}

#[cfg(windows)]
mod platform {
    use super::{BoxedReader, BoxedWriter, TransportError};
    use std::path::{Path, PathBuf};
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    pub fn endpoint_paths(_dir: &Path, tag: &str) -> (PathBuf, PathBuf) {
        let pid = std::process::id();
        (
            PathBuf::from(format!(r"\\.\pipe\gamedl-{tag}-{pid}-req")),
            PathBuf::from(format!(r"\\.\pipe\gamedl-{tag}-{pid}-res")),
        )
    }

    pub struct Listeners {
        request: NamedPipeServer,
        response: NamedPipeServer,
    }

    impl Listeners {
        pub fn bind(request: &Path, response: &Path) -> Result<Self, TransportError> {
            Ok(Self {
                request: ServerOptions::new().first_pipe_instance(true).create(request)?,
                response: ServerOptions::new().first_pipe_instance(true).create(response)?,
            })
        }

        pub async fn accept(self) -> Result<(BoxedReader, BoxedWriter), TransportError> {
            tokio::try_join!(self.request.connect(), self.response.connect())?;
            let (_, writer) = tokio::io::split(self.request);
            let (reader, _) = tokio::io::split(self.response);
            Ok((Box::new(reader), Box::new(writer)))
        }
    }

    pub fn cleanup(_request: &Path, _response: &Path) {}
}
