use std::collections::TryReserveError;
use std::io::{self, Write};
use thiserror::Error;

use crate::base64_codec;
use crate::config::protocol;
use crate::log_debug;

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("not enough memory to encode {len} bytes: {source}")]
    Allocation {
        len: usize,
        #[source]
        source: TryReserveError,
    },
    #[error("failed to write graphics frame: {0}")]
    Io(#[from] io::Error),
}

/// One frame's worth of the encoded payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub data: &'a [u8],
    pub is_final: bool,
    /// Transfer parameters, first chunk only
    pub params: Option<&'a str>,
}

impl Chunk<'_> {
    /// `<params>,m=<0|1>` on the first chunk, `m=<0|1>` after that
    pub fn command(&self) -> String {
        let more = if self.is_final { 0 } else { 1 };
        match self.params {
            Some(params) if !params.is_empty() => format!("{},m={}", params, more),
            _ => format!("m={}", more),
        }
    }

    /// `ESC _ G <command> ; <data> ESC \`
    pub fn write_frame<W: Write + ?Sized>(&self, output: &mut W) -> io::Result<()> {
        output.write_all(protocol::FRAME_START)?;
        output.write_all(self.command().as_bytes())?;
        output.write_all(b";")?;
        output.write_all(self.data)?;
        output.write_all(protocol::FRAME_END)
    }
}

/// Split `encoded` into frames of at most `chunk_size` bytes.
///
/// Always yields at least one chunk; an empty payload gives a single empty
/// final chunk that still carries `params`.
pub fn chunks<'a>(
    encoded: &'a [u8],
    chunk_size: usize,
    params: &'a str,
) -> impl Iterator<Item = Chunk<'a>> + 'a {
    let size = chunk_size.max(1);
    let count = encoded.len().div_ceil(size).max(1);

    (0..count).map(move |i| {
        let start = (i * size).min(encoded.len());
        let end = (start + size).min(encoded.len());
        Chunk {
            data: &encoded[start..end],
            is_final: i + 1 == count,
            params: (i == 0).then_some(params),
        }
    })
}

pub struct ChunkedTransmitter {
    chunk_size: usize,
}

impl ChunkedTransmitter {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size: chunk_size.max(1) }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Base64 the payload and write it as a chunked graphics transfer,
    /// flushing after every frame. Returns the number of frames written.
    pub fn send<W: Write + ?Sized>(
        &self,
        output: &mut W,
        payload: &[u8],
        params: &str,
    ) -> Result<usize, TransmitError> {
        let encoded = base64_codec::try_encode(payload)
            .map_err(|source| TransmitError::Allocation { len: payload.len(), source })?;

        let mut frames = 0;
        for chunk in chunks(encoded.as_bytes(), self.chunk_size, params) {
            chunk.write_frame(output)?;
            output.flush()?;
            frames += 1;
        }

        log_debug!(
            "[GRAPHICS] sent {} bytes as {} encoded chars in {} frames",
            payload.len(),
            encoded.len(),
            frames
        );
        Ok(frames)
    }
}

impl Default for ChunkedTransmitter {
    fn default() -> Self {
        Self::new(protocol::CHUNK_SIZE)
    }
}
