use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Wraps raw image bytes as a `data:` URI.
pub fn encode(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))
}

/// Splits a base64 `data:` URI into its mime type and decoded payload.
pub fn decode(uri: &str) -> Result<(String, Vec<u8>)> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("not a data URI"))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("data URI has no payload"))?;
    let mime_type = meta
        .strip_suffix(";base64")
        .ok_or_else(|| anyhow!("only base64 data URIs are supported"))?;
    let bytes = STANDARD
        .decode(payload.trim())
        .context("data URI payload is not valid base64")?;
    if bytes.is_empty() {
        return Err(anyhow!("data URI payload is empty"));
    }
    Ok((mime_type.to_string(), bytes))
}
