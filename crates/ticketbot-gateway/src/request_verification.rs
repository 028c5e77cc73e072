//! Slack request signing verification (v0 HMAC-SHA256 scheme).

use anyhow::{anyhow, bail, Context, Result};
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SLACK_SIGNATURE_HEADER: &str = "x-slack-signature";
pub const SLACK_TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Verifies the signature headers Slack attaches to every request.
///
/// `max_skew_seconds == 0` disables the timestamp freshness check.
pub fn verify_slack_request(
    headers: &HeaderMap,
    body: &[u8],
    signing_secret: &str,
    now_unix_seconds: u64,
    max_skew_seconds: u64,
) -> Result<()> {
    let signature = header_value(headers, SLACK_SIGNATURE_HEADER)?;
    let timestamp = header_value(headers, SLACK_TIMESTAMP_HEADER)?;
    validate_timestamp_skew(timestamp, now_unix_seconds, max_skew_seconds)?;
    let payload = std::str::from_utf8(body).context("slack request body is not valid utf-8")?;
    verify_slack_v0_signature(payload, signature, timestamp, signing_secret)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .ok_or_else(|| anyhow!("missing required header '{name}'"))?
        .to_str()
        .with_context(|| format!("header '{name}' is not valid ascii"))
}

fn verify_slack_v0_signature(
    payload: &str,
    signature: &str,
    timestamp: &str,
    secret: &str,
) -> Result<()> {
    let Some(digest_hex) = signature.trim().strip_prefix("v0=") else {
        bail!("slack request signature must use v0=<hex> format");
    };
    let signature_bytes = decode_hex(digest_hex)?;
    let signed_payload = format!("v0:{timestamp}:{payload}");
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .context("failed to initialize request HMAC verifier")?;
    mac.update(signed_payload.as_bytes());
    mac.verify_slice(&signature_bytes)
        .map_err(|_| anyhow!("slack request signature verification failed"))
}

fn decode_hex(value: &str) -> Result<Vec<u8>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("signature digest cannot be empty");
    }
    if trimmed.len() % 2 != 0 {
        bail!("signature digest must have an even number of hex characters");
    }

    let mut bytes = Vec::with_capacity(trimmed.len() / 2);
    let raw = trimmed.as_bytes();
    let mut index = 0usize;
    while index < raw.len() {
        let hex = std::str::from_utf8(&raw[index..index + 2]).context("invalid utf-8 in digest")?;
        let byte = u8::from_str_radix(hex, 16)
            .with_context(|| format!("invalid hex byte '{hex}' in signature digest"))?;
        bytes.push(byte);
        index = index.saturating_add(2);
    }
    Ok(bytes)
}

fn validate_timestamp_skew(timestamp: &str, now_seconds: u64, max_skew_seconds: u64) -> Result<()> {
    let timestamp_seconds = timestamp
        .trim()
        .parse::<u64>()
        .with_context(|| format!("invalid slack request timestamp '{timestamp}'"))?;
    if max_skew_seconds == 0 {
        return Ok(());
    }
    let skew = now_seconds.abs_diff(timestamp_seconds);
    if skew > max_skew_seconds {
        bail!("slack request timestamp skew {skew}s exceeds max {max_skew_seconds}s");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn slack_v0_signature(secret: &str, timestamp: &str, payload: &str) -> String {
    let signed = format!("v0:{timestamp}:{payload}");
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("mac");
    mac.update(signed.as_bytes());
    let digest = mac.finalize().into_bytes();
    format!(
        "v0={}",
        digest
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>()
    )
}
