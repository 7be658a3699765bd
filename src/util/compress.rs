//! Gzip helpers for bundle payloads.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Gzip a script payload.
pub fn compress(s: &str) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(s.as_bytes())?;
    encoder.finish()
}

/// Gunzip a bundle payload back into the script source.
pub fn decompress(bytes: &[u8]) -> std::io::Result<String> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_then_decompress() {
        let script = "print('hello'); allow()";
        let compressed = compress(script).unwrap();
        assert_ne!(compressed.as_slice(), script.as_bytes());
        assert_eq!(decompress(&compressed).unwrap(), script);
    }

    #[test]
    fn decompress_rejects_garbage() {
        assert!(decompress(b"not gzip at all").is_err());
    }
}
