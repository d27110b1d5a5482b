//! Snapshot file format.
//!
//! ```text
//! skippy-snapshot v1
//! <json body>
//! skippy-end <body length> <xxh3 of body>
//! ```
//!
//! The trailer is written last, so any truncation (including a zero-byte
//! file) fails the length or hash check instead of yielding a partial map.

use xxhash_rust::xxh3::xxh3_64;

use crate::unit::AnalysisSnapshot;

pub const FORMAT_VERSION: u32 = 1;
const HEADER_TAG: &str = "skippy-snapshot";
const TRAILER_TAG: &str = "skippy-end";

pub fn encode(snapshot: &AnalysisSnapshot) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_vec(snapshot)?;
    let trailer = format!("{TRAILER_TAG} {} {:016x}\n", body.len(), xxh3_64(&body));

    let mut out = Vec::with_capacity(body.len() + trailer.len() + 32);
    out.extend_from_slice(format!("{HEADER_TAG} v{FORMAT_VERSION}\n").as_bytes());
    out.extend_from_slice(&body);
    out.push(b'\n');
    out.extend_from_slice(trailer.as_bytes());
    Ok(out)
}

/// Decode a snapshot file. The error string says which check failed.
pub fn decode(bytes: &[u8]) -> Result<AnalysisSnapshot, String> {
    if bytes.is_empty() {
        return Err("empty file".to_string());
    }

    let (header, rest) = split_line(bytes).ok_or("missing header line")?;
    let header = std::str::from_utf8(header).map_err(|_| "header is not utf-8")?;
    let version = header
        .strip_prefix(HEADER_TAG)
        .and_then(|v| v.trim().strip_prefix('v'))
        .ok_or_else(|| format!("unrecognised header '{header}'"))?;
    if version != FORMAT_VERSION.to_string() {
        return Err(format!("unsupported format version v{version}"));
    }

    let rest = rest
        .strip_suffix(b"\n")
        .ok_or("missing trailer (file truncated)")?;
    let split = rest
        .iter()
        .rposition(|b| *b == b'\n')
        .ok_or("missing trailer (file truncated)")?;
    let (body, trailer) = (&rest[..split], &rest[split + 1..]);

    let trailer = std::str::from_utf8(trailer).map_err(|_| "trailer is not utf-8")?;
    let mut fields = trailer.split_whitespace();
    if fields.next() != Some(TRAILER_TAG) {
        return Err("missing trailer (file truncated)".to_string());
    }
    let expected_len: usize = fields
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or("malformed trailer length")?;
    let expected_hash = fields
        .next()
        .and_then(|v| u64::from_str_radix(v, 16).ok())
        .ok_or("malformed trailer hash")?;

    if body.len() != expected_len {
        return Err(format!(
            "body length {} does not match trailer {}",
            body.len(),
            expected_len
        ));
    }
    if xxh3_64(body) != expected_hash {
        return Err("body hash does not match trailer".to_string());
    }

    serde_json::from_slice(body).map_err(|e| format!("invalid body: {e}"))
}

fn split_line(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = bytes.iter().position(|b| *b == b'\n')?;
    Some((&bytes[..pos], &bytes[pos + 1..]))
}
