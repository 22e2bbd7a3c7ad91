use std::path::Path;

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

pub fn slugify<S: AsRef<str>>(input: S) -> String {
    input
        .as_ref()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

/// Preferred file extension for a MIME type, `bin` when unknown.
pub fn extension_for_mime(mime: &str) -> &'static str {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    match essence {
        "audio/mpeg" => "mp3",
        "audio/wav" => "wav",
        "video/mp4" => "mp4",
        "image/jpeg" => "jpg",
        "text/plain" => "txt",
        _ => mime_guess::get_mime_extensions_str(essence)
            .and_then(|exts| exts.first().copied())
            .unwrap_or("bin"),
    }
}

/// MIME type implied by the path of a URL, ignoring its query.
pub fn mime_from_url(url: &str) -> Option<String> {
    let path = url::Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.split('?').next().unwrap_or(url).to_string());
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_filesystem_safe() {
        assert_eq!(slugify("Instagram Story / 9:16"), "Instagram-Story---9-16");
        assert_eq!(slugify("tiktok"), "tiktok");
    }

    #[test]
    fn extensions_follow_mime() {
        assert_eq!(extension_for_mime("audio/mpeg"), "mp3");
        assert_eq!(extension_for_mime("image/png"), "png");
        assert_eq!(extension_for_mime("audio/wav; rate=24000"), "wav");
        assert_eq!(extension_for_mime("application/x-unknown-thing"), "bin");
    }

    #[test]
    fn guesses_mime_from_url_path() {
        assert_eq!(
            mime_from_url("https://cdn.test/out/clip.mp4?sig=abc").as_deref(),
            Some("video/mp4")
        );
        assert_eq!(mime_from_url("https://cdn.test/blob"), None);
    }
}
