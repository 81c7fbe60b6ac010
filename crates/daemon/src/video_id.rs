//! Platform video id extraction.
//!
//! Only YouTube ids are recognized. Anything else yields `None`; the cache
//! token, not this id, is the external identifier for a cached file.

use url::Url;

const YOUTUBE_ID_LEN: usize = 11;

fn is_youtube_host(host: &str) -> bool {
    let host = host.strip_prefix("www.").unwrap_or(host);
    let host = host.strip_prefix("m.").unwrap_or(host);
    matches!(host, "youtube.com" | "youtu.be" | "youtube-nocookie.com")
}

fn valid_id(candidate: &str) -> Option<String> {
    let ok = candidate.len() == YOUTUBE_ID_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    ok.then(|| candidate.to_string())
}

/// Extract the 11-character YouTube id from `watch?v=`, `youtu.be/`,
/// `shorts/` and `embed/` URLs.
pub fn extract_video_id(source: &str) -> Option<String> {
    let url = Url::parse(source.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    if !is_youtube_host(&host) {
        return None;
    }

    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());

    if host.ends_with("youtu.be") {
        return valid_id(segments.next()?);
    }

    match segments.next() {
        Some("watch") => url
            .query_pairs()
            .find(|(key, _)| key == "v")
            .and_then(|(_, value)| valid_id(&value)),
        Some("shorts") | Some("embed") | Some("v") | Some("live") => valid_id(segments.next()?),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_url_shapes() {
        let id = Some("dQw4w9WgXcQ".to_string());
        assert_eq!(extract_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ"), id);
        assert_eq!(extract_video_id("https://youtube.com/watch?t=10&v=dQw4w9WgXcQ"), id);
        assert_eq!(extract_video_id("https://m.youtube.com/watch?v=dQw4w9WgXcQ"), id);
        assert_eq!(extract_video_id("https://youtu.be/dQw4w9WgXcQ?t=3"), id);
        assert_eq!(extract_video_id("https://www.youtube.com/shorts/dQw4w9WgXcQ"), id);
        assert_eq!(extract_video_id("https://www.youtube.com/embed/dQw4w9WgXcQ"), id);
        assert_eq!(extract_video_id("  https://youtu.be/dQw4w9WgXcQ  "), id);
    }

    #[test]
    fn test_rejects_other_sources() {
        assert_eq!(extract_video_id("https://vimeo.com/123456"), None);
        assert_eq!(extract_video_id("https://example.com/watch?v=dQw4w9WgXcQ"), None);
        assert_eq!(extract_video_id("https://www.youtube.com/watch?v=short"), None);
        assert_eq!(extract_video_id("https://www.youtube.com/channel/UC123"), None);
        assert_eq!(extract_video_id("not a url"), None);
        assert_eq!(extract_video_id("https://youtu.be/"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_watch_id_round_trips(id in "[A-Za-z0-9_-]{11}") {
            let url = format!("https://www.youtube.com/watch?v={}", id);
            prop_assert_eq!(extract_video_id(&url), Some(id.clone()));
            let short = format!("https://youtu.be/{}", id);
            prop_assert_eq!(extract_video_id(&short), Some(id));
        }
    }
}
