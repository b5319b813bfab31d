use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

// ENV config for maximum allowed size (in bytes) of a decompressed batch file.
// This prevents zip-bomb style decompression from exhausting memory.
pub const DEFAULT_MAX_DECOMPRESSED_BATCH_BYTES: usize = 256 * 1024 * 1024; // 256 MiB

pub fn max_batch_file_bytes() -> usize {
    if let Ok(mb_str) = std::env::var("OPENVOTE_MAX_BATCH_FILE_MB") {
        if let Ok(mb) = mb_str.parse::<usize>() {
            return mb.saturating_mul(1024 * 1024);
        }
    }
    DEFAULT_MAX_DECOMPRESSED_BATCH_BYTES
}

pub fn read_all_with_limit<R: Read>(mut reader: R, max_size: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(std::cmp::min(max_size, 64 * 1024));
    let mut chunk = [0u8; 8192];
    let mut total = 0usize;
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        total += n;
        if total > max_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "decompressed size limit exceeded",
            ));
        }
        out.extend_from_slice(&chunk[..n]);
    }
    Ok(out)
}

pub fn decompress_gzip_with_limit<R: Read>(reader: R, max_size: usize) -> io::Result<Vec<u8>> {
    let decoder = GzDecoder::new(reader);
    read_all_with_limit(decoder, max_size)
}

/// Read a file, gunzipping it when `is_compressed`. Both paths honour `max_size`.
pub fn read_file_with_limit(path: &Path, is_compressed: bool, max_size: usize) -> io::Result<Vec<u8>> {
    let file = File::open(path)?;
    if is_compressed {
        decompress_gzip_with_limit(file, max_size)
    } else {
        read_all_with_limit(file, max_size)
    }
}

pub fn write_file(path: &Path, data: &[u8], compress: bool) -> io::Result<()> {
    let file = File::create(path)?;
    if compress {
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(data)?;
        enc.finish()?;
    } else {
        let mut file = file;
        file.write_all(data)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_rejects_oversized_payloads() {
        let data = vec![7u8; 20_000];
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&data).unwrap();
        let compressed = enc.finish().unwrap();

        let out = decompress_gzip_with_limit(&compressed[..], 20_000).unwrap();
        assert_eq!(out, data);

        let err = decompress_gzip_with_limit(&compressed[..], 19_999).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
