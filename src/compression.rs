//! Payload compression shared by the peer transport and HTTP storage
//! requests.

use std::io::{Read, Write};

use anyhow::{bail, Context, Result};

/// Compresses data using the specified algorithm.
pub fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zstd" => zstd::encode_all(data, 0).context("zstd encode"),
        "snappy" => snap::raw::Encoder::new()
            .compress_vec(data)
            .context("snappy encode"),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Reverses [`compress`].
pub fn decompress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::with_capacity(data.len() * 2);
            decoder.read_to_end(&mut out).context("gzip decode")?;
            Ok(out)
        }
        "zstd" => zstd::decode_all(data).context("zstd decode"),
        "snappy" => snap::raw::Decoder::new()
            .decompress_vec(data)
            .context("snappy decode"),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
pub fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "snappy" => Some("snappy"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}
