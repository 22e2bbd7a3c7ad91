//! Response normalizer helpers shared by the provider adapters.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use serde_json::Value;

use crate::core::{GenerationRequest, Payload};
use crate::error::ProviderError;

pub const DEFAULT_PCM_RATE: u32 = 24_000;

pub fn decode_base64(data: &str) -> Result<Vec<u8>, ProviderError> {
    let raw = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(cleaned.as_bytes())
        .map_err(|err| ProviderError::parse(format!("invalid base64 content: {err}")))
}

/// First non-empty string found at any of the JSON pointers.
pub fn first_str<'a>(value: &'a Value, pointers: &[&str]) -> Option<&'a str> {
    pointers
        .iter()
        .filter_map(|pointer| value.pointer(pointer))
        .filter_map(Value::as_str)
        .find(|s| !s.is_empty())
}

pub fn require_str<'a>(
    value: &'a Value,
    pointers: &[&str],
    what: &str,
) -> Result<&'a str, ProviderError> {
    first_str(value, pointers)
        .ok_or_else(|| ProviderError::parse(format!("response is missing {what}")))
}

/// Text completion into a payload; parses JSON when the request asked for
/// structured output.
pub fn text_payload(request: &GenerationRequest, text: &str) -> Result<Payload, ProviderError> {
    if text.trim().is_empty() {
        return Err(ProviderError::parse("provider returned an empty completion"));
    }
    if request.wants_structured() {
        return extract_json(text).map(Payload::Structured);
    }
    Ok(Payload::Text(text.to_string()))
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("valid regex"))
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("valid regex"))
}

/// Parses JSON out of a model completion. The leniency is applied in this
/// fixed order, stopping at the first step that parses:
///
/// 1. trim, and keep only the body of the first code fence if there is one
/// 2. parse as is
/// 3. parse the object span from the first `{` to the last `}`
/// 4. drop trailing commas before `}` or `]` in that span
/// 5. additionally swap single quotes for double quotes
///
/// Steps 3 to 5 then run again on the `[`..`]` span when the object span is
/// missing or still unparsable. Anything left is a `ResponseParse` error.
pub fn extract_json(text: &str) -> Result<Value, ProviderError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::parse("empty JSON text"));
    }
    let unfenced = match fence_re().captures(trimmed) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or("").trim(),
        None => trimmed,
    };

    if let Ok(value) = serde_json::from_str(unfenced) {
        return Ok(value);
    }

    let spans = [json_span(unfenced, '{', '}'), json_span(unfenced, '[', ']')];
    let mut last_err = None;
    for span in spans.into_iter().flatten() {
        match repair_span(span) {
            Ok(value) => return Ok(value),
            Err(err) => last_err = Some(err),
        }
    }
    let err = match last_err {
        Some(err) => err,
        None => match repair_span(unfenced) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        },
    };
    let excerpt: String = trimmed.chars().take(200).collect();
    Err(ProviderError::parse(format!(
        "could not parse JSON ({err}): {excerpt}"
    )))
}

fn repair_span(span: &str) -> Result<Value, serde_json::Error> {
    if let Ok(value) = serde_json::from_str(span) {
        return Ok(value);
    }
    let without_commas = trailing_comma_re().replace_all(span, "$1");
    if let Ok(value) = serde_json::from_str(&without_commas) {
        return Ok(value);
    }
    serde_json::from_str(&without_commas.replace('\'', "\""))
}

fn json_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Parses the sample rate from MIME types like `audio/L16;codec=pcm;rate=24000`.
pub fn pcm_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Wraps raw little-endian PCM samples in a RIFF/WAVE header.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * block_align as u32;
    let data_len = pcm.len() as u32;
    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}
