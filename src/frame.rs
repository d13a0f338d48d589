//! Turning a batch of records into one uploadable payload.
//!
//! Records pass through three stages: a [`RecordEncoder`] renders one record
//! as bytes, [`Framing`] writes the per-record layout (length prefix and/or
//! delimiter), and a [`Compressor`] squeezes the concatenated stream.
use crate::error::{Error, Result};

use bytes::{BufMut as _, Bytes, BytesMut};
use serde::Serialize;
use std::fmt::{self, Debug, Formatter};
use std::io::Write as _;
use std::sync::Arc;

/// Encoding for one record in a batch.
pub trait RecordEncoder<R>: Send + Sync {
    /// Encode this record, appending its bytes to `dst`.
    fn encode(&self, record: &R, dst: &mut BytesMut) -> Result<()>;
}

/// Passes records through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesEncoder;

impl<R: AsRef<[u8]>> RecordEncoder<R> for BytesEncoder {
    fn encode(&self, record: &R, dst: &mut BytesMut) -> Result<()> {
        let bytes = record.as_ref();
        dst.reserve(bytes.len());
        dst.put(bytes);
        Ok(())
    }
}

/// Encodes records as JSON.
///
/// Combined with the default newline delimiter this produces jsonlines
/// objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl<R: Serialize> RecordEncoder<R> for JsonEncoder {
    fn encode(&self, record: &R, dst: &mut BytesMut) -> Result<()> {
        let it = serde_json::to_vec(record).map_err(Error::encoding)?;
        dst.reserve(it.len());
        dst.put(it.as_slice());
        Ok(())
    }
}

/// Per-record layout within the concatenated batch stream.
#[derive(Debug, Clone)]
pub struct Framing {
    /// Separator appended after each record. `None` writes no separator.
    pub delimiter: Option<Bytes>,
    /// Prepend each record with its length as a big-endian `u32`.
    pub sized: bool,
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            delimiter: Some(Bytes::from_static(b"\n")),
            sized: false,
        }
    }
}

impl Framing {
    /// Write one encoded record into `dst` with this layout. The length
    /// prefix covers the record only, not the delimiter.
    pub fn frame_into(&self, encoded: &[u8], dst: &mut BytesMut) {
        let extra = 4 + self.delimiter.as_ref().map_or(0, |d| d.len());
        dst.reserve(encoded.len() + extra);
        if self.sized {
            dst.put_u32(encoded.len() as u32);
        }
        dst.put(encoded);
        if let Some(d) = &self.delimiter {
            dst.put(d.as_ref());
        }
    }
}

/// Compression applied to a whole batch payload.
#[derive(Clone, Default)]
pub enum Compressor {
    #[default]
    Identity,
    Gzip,
    Snappy,
    Bzip2,
    /// A caller-supplied bytes-to-bytes function.
    Custom(Arc<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>),
}

impl Compressor {
    /// Wrap a custom compression function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// The object-key suffix implied by this compressor.
    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            Self::Identity | Self::Custom(_) => None,
            Self::Gzip => Some("gz"),
            Self::Snappy => Some("snappy"),
            Self::Bzip2 => Some("bz2"),
        }
    }

    pub fn compress(&self, input: &[u8]) -> Result<Bytes> {
        match self {
            Self::Identity => Ok(Bytes::copy_from_slice(input)),
            Self::Gzip => {
                let mut enc =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(input).map_err(Error::encoding)?;
                enc.finish().map(Bytes::from).map_err(Error::encoding)
            }
            Self::Snappy => {
                let mut enc = snap::write::FrameEncoder::new(Vec::new());
                enc.write_all(input).map_err(Error::encoding)?;
                enc.into_inner()
                    .map(Bytes::from)
                    .map_err(|e| Error::encoding(e.into_error()))
            }
            Self::Bzip2 => {
                let mut enc =
                    bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
                enc.write_all(input).map_err(Error::encoding)?;
                enc.finish().map(Bytes::from).map_err(Error::encoding)
            }
            Self::Custom(f) => f(input).map(Bytes::from),
        }
    }
}

impl Debug for Compressor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Identity => "Identity",
            Self::Gzip => "Gzip",
            Self::Snappy => "Snappy",
            Self::Bzip2 => "Bzip2",
            Self::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

/// Encode, frame, and compress one batch. An empty batch yields an empty
/// payload with no compression envelope.
pub(crate) fn encode_batch<R>(
    records: &[R],
    encoder: &dyn RecordEncoder<R>,
    framing: &Framing,
    compressor: &Compressor,
) -> Result<Bytes> {
    if records.is_empty() {
        return Ok(Bytes::new());
    }
    let mut raw = BytesMut::new();
    let mut scratch = BytesMut::new();
    for record in records {
        scratch.clear();
        encoder.encode(record, &mut scratch)?;
        framing.frame_into(&scratch, &mut raw);
    }
    compressor.compress(&raw)
}
