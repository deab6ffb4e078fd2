//! Single-member extraction from (possibly compressed) tar streams.

use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::debug;

use crate::chunkdict::compression::decompress_stream;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The compressed envelope could not be opened
    #[error("decompress stream: {0}")]
    Decompress(#[source] io::Error),

    /// The tar stream is truncated or malformed
    #[error("read tar stream: {0}")]
    Corrupt(#[source] io::Error),

    #[error("write {member}: {source}")]
    Write {
        member: String,
        #[source]
        source: io::Error,
    },

    #[error("not found file {0} in archive")]
    NotFound(String),
}

impl ExtractError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExtractError::NotFound(_))
    }
}

/// Copy the first entry named exactly `member` from `reader` into `sink`
///
/// The input may be gzip, xz, zstd or plain; the envelope is detected from
/// its leading bytes. Scanning stops at the first match. Returns the number of
/// bytes written.
pub fn unpack_file<R, W>(reader: R, member: &str, sink: &mut W) -> Result<u64, ExtractError>
where
    R: Read + Send,
    W: Write + ?Sized,
{
    let (decoded, compression) = decompress_stream(reader).map_err(ExtractError::Decompress)?;
    debug!(member = %member, compression = %compression, "Scanning archive");

    let mut archive = tar::Archive::new(decoded);
    for entry in archive.entries().map_err(ExtractError::Corrupt)? {
        let mut entry = entry.map_err(ExtractError::Corrupt)?;
        if entry.path_bytes().as_ref() != member.as_bytes() {
            continue;
        }

        let expected = entry.size();
        let copied = copy_entry(&mut entry, sink).map_err(|e| match e {
            CopyError::Read(e) => ExtractError::Corrupt(e),
            CopyError::Write(source) => ExtractError::Write {
                member: member.to_string(),
                source,
            },
        })?;

        // The tar reader reports a short entry as a clean EOF
        if copied != expected {
            return Err(ExtractError::Corrupt(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} truncated at {} of {} bytes", member, copied, expected),
            )));
        }

        sink.flush().map_err(|source| ExtractError::Write {
            member: member.to_string(),
            source,
        })?;
        return Ok(copied);
    }

    Err(ExtractError::NotFound(member.to_string()))
}

enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

/// `io::copy` that keeps read and write failures apart
fn copy_entry<R: Read, W: Write + ?Sized>(reader: &mut R, sink: &mut W) -> Result<u64, CopyError> {
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        };
        sink.write_all(&buffer[..n]).map_err(CopyError::Write)?;
        total += n as u64;
    }
}
