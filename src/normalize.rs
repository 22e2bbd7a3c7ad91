//! Shared pieces of the request normalizer. Each provider module owns its own
//! lookup tables and calls into these helpers from `build_payload`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::core::GenerationRequest;
use crate::providers::CallContext;

/// Fixed vocabulary translation with a documented default for anything the
/// provider does not support.
#[derive(Debug, Clone, Copy)]
pub struct LookupTable {
    pub entries: &'static [(&'static str, &'static str)],
    pub default: &'static str,
}

impl LookupTable {
    pub const fn new(
        entries: &'static [(&'static str, &'static str)],
        default: &'static str,
    ) -> Self {
        Self { entries, default }
    }

    pub fn translate(&self, value: Option<&str>) -> &'static str {
        let Some(value) = value else {
            return self.default;
        };
        let canonical = canonical_aspect(value);
        self.entries
            .iter()
            .find(|(key, _)| *key == canonical)
            .map(|(_, mapped)| *mapped)
            .unwrap_or(self.default)
    }
}

/// Accepts `9x16`, `9/16`, ` 9:16 ` and the words portrait/landscape/square.
pub fn canonical_aspect(value: &str) -> String {
    let trimmed = value.trim().to_lowercase();
    match trimmed.as_str() {
        "portrait" | "vertical" | "story" => return "9:16".to_string(),
        "landscape" | "horizontal" | "wide" => return "16:9".to_string(),
        "square" => return "1:1".to_string(),
        _ => {}
    }
    trimmed
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == 'x' || c == '/' { ':' } else { c })
        .collect()
}

/// Requested duration when the provider offers it, otherwise the default.
pub fn pick_duration(requested: Option<u32>, allowed: &[u32], default: u32) -> u32 {
    requested
        .filter(|seconds| allowed.contains(seconds))
        .unwrap_or(default)
}

pub fn clamp_temperature(value: Option<f64>, default: f64) -> f64 {
    value
        .filter(|t| t.is_finite())
        .map(|t| t.clamp(0.0, 2.0))
        .unwrap_or(default)
}

pub fn data_uri(data: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(data))
}

pub fn encode_inline(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// URL-addressable reference image: the published URL when the dispatcher
/// obtained one, else an inline data URI of the request's bytes.
pub fn reference_uri(request: &GenerationRequest, ctx: &CallContext<'_>) -> Option<String> {
    if let Some(url) = ctx.reference_url {
        return Some(url.to_string());
    }
    request
        .reference_image()
        .map(|(data, mime)| data_uri(data, mime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Capability;

    const TABLE: LookupTable =
        LookupTable::new(&[("9:16", "portrait"), ("16:9", "landscape")], "square");

    #[test]
    fn translates_known_values_and_defaults_the_rest() {
        assert_eq!(TABLE.translate(Some("9:16")), "portrait");
        assert_eq!(TABLE.translate(Some(" 16x9 ")), "landscape");
        assert_eq!(TABLE.translate(Some("vertical")), "portrait");
        assert_eq!(TABLE.translate(Some("21:9")), "square");
        assert_eq!(TABLE.translate(None), "square");
    }

    #[test]
    fn durations_fall_back_to_default() {
        assert_eq!(pick_duration(Some(10), &[5, 10], 5), 10);
        assert_eq!(pick_duration(Some(7), &[5, 10], 5), 5);
        assert_eq!(pick_duration(None, &[4, 6, 8], 8), 8);
    }

    #[test]
    fn reference_prefers_published_url() {
        let request = GenerationRequest::new(Capability::Video, "spin")
            .with_reference_image(vec![1, 2, 3], "image/png");
        let inline = CallContext::new("key");
        assert_eq!(
            reference_uri(&request, &inline).as_deref(),
            Some("data:image/png;base64,AQID")
        );
        let published = CallContext::new("key").with_reference_url(Some("https://i.test/a.png"));
        assert_eq!(
            reference_uri(&request, &published).as_deref(),
            Some("https://i.test/a.png")
        );
    }

    #[test]
    fn temperature_is_clamped() {
        assert_eq!(clamp_temperature(Some(3.5), 0.7), 2.0);
        assert_eq!(clamp_temperature(None, 0.7), 0.7);
    }
}
