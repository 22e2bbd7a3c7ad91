use serde::Serialize;

use crate::core::{Capability, GenerationRequest};

/// A publishing target with its canvas size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Platform {
    pub key: &'static str,
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub aspect: &'static str,
}

const fn platform(
    key: &'static str,
    label: &'static str,
    width: u32,
    height: u32,
    aspect: &'static str,
) -> Platform {
    Platform {
        key,
        label,
        width,
        height,
        aspect,
    }
}

pub const PLATFORMS: &[Platform] = &[
    platform("post_1_1", "Post 1:1", 1080, 1080, "1:1"),
    platform("story_9_16", "Story 9:16", 1080, 1920, "9:16"),
    platform("wide_16_9", "Wide 16:9", 1280, 720, "16:9"),
    platform("instagram_post", "Instagram Post", 1080, 1080, "1:1"),
    platform("instagram_story", "Instagram Story", 1080, 1920, "9:16"),
    platform("tiktok", "TikTok", 1080, 1920, "9:16"),
    platform("youtube_short", "YouTube Short", 1080, 1920, "9:16"),
    platform("youtube_thumb", "YouTube Thumbnail", 1280, 720, "16:9"),
    platform("twitter", "Twitter/X", 1200, 675, "16:9"),
    platform("facebook", "Facebook", 1200, 630, "16:9"),
    platform("snapchat", "Snapchat", 1080, 1920, "9:16"),
    platform("linkedin", "LinkedIn", 1200, 627, "16:9"),
    platform("pinterest", "Pinterest", 1000, 1500, "2:3"),
];

pub fn find(key: &str) -> Option<&'static Platform> {
    PLATFORMS.iter().find(|platform| platform.key == key)
}

/// One image request per known platform key, in the order given. Unknown
/// keys are skipped and returned separately.
pub fn plan_platform_requests(
    base: &GenerationRequest,
    keys: &[String],
) -> (Vec<(String, GenerationRequest)>, Vec<String>) {
    let mut planned = Vec::new();
    let mut unknown = Vec::new();
    for key in keys {
        match find(key) {
            Some(platform) => {
                if planned.iter().any(|(seen, _)| seen == key) {
                    continue;
                }
                let mut request = base.clone().with_aspect_ratio(platform.aspect);
                request.capability = Capability::Image;
                planned.push((platform.key.to_string(), request));
            }
            None => unknown.push(key.clone()),
        }
    }
    (planned, unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_aspects_match_canvas() {
        for platform in PLATFORMS {
            let portrait = platform.height > platform.width;
            let square = platform.height == platform.width;
            match platform.aspect {
                "1:1" => assert!(square, "{}", platform.key),
                "9:16" | "2:3" => assert!(portrait, "{}", platform.key),
                _ => assert!(!portrait && !square, "{}", platform.key),
            }
        }
        assert_eq!(PLATFORMS.len(), 13);
    }

    #[test]
    fn plans_one_request_per_target() {
        let base = GenerationRequest::new(Capability::Image, "oud bottle").with_voice("ignored");
        let keys = vec![
            "tiktok".to_string(),
            "pinterest".to_string(),
            "myspace".to_string(),
            "tiktok".to_string(),
        ];
        let (planned, unknown) = plan_platform_requests(&base, &keys);
        assert_eq!(unknown, vec!["myspace".to_string()]);
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].1.aspect_ratio(), Some("9:16"));
        assert_eq!(planned[1].1.aspect_ratio(), Some("2:3"));
        assert_eq!(planned[1].1.prompt, "oud bottle");
    }
}
