use crate::error::{QueueError, Result};

const KNOWN_SITES: &[(&str, &str)] = &[
    ("youtube.com", "YouTube"),
    ("youtu.be", "YouTube"),
    ("tiktok.com", "TikTok"),
    ("facebook.com", "Facebook"),
    ("instagram.com", "Instagram"),
    ("twitter.com", "Twitter"),
    ("x.com", "Twitter"),
    ("reddit.com", "Reddit"),
    ("soundcloud.com", "SoundCloud"),
    ("vimeo.com", "Vimeo"),
    ("twitch.tv", "Twitch"),
    ("pinterest.com", "Pinterest"),
];

/// Accepts absolute http(s) URLs with a host. Everything else is rejected
/// before it can reach the queue.
pub fn validate_url(url_str: &str) -> Result<url::Url> {
    let trimmed = url_str.trim();
    if trimmed.is_empty() {
        return Err(QueueError::invalid_input("empty URL"));
    }
    let parsed = url::Url::parse(trimmed)
        .map_err(|e| QueueError::invalid_input(format!("malformed URL '{}': {}", trimmed, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(QueueError::invalid_input(format!(
                "unsupported URL scheme '{}'",
                other
            )))
        }
    }

    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(parsed),
        _ => Err(QueueError::invalid_input(format!(
            "URL '{}' has no host",
            trimmed
        ))),
    }
}

/// Display name of the hosting site, matched on the host and its parents.
pub fn detect_platform(url_str: &str) -> &'static str {
    let host = match url::Url::parse(url_str.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
    {
        Some(h) => h,
        None => return "Unknown",
    };

    KNOWN_SITES
        .iter()
        .find(|(domain, _)| host == *domain || host.ends_with(&format!(".{}", domain)))
        .map(|(_, name)| *name)
        .unwrap_or("Unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https() {
        assert!(validate_url("https://example.com/v1").is_ok());
        assert!(validate_url("  http://example.com  ").is_ok());
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "not a url", "example.com/video", "ftp://example.com/a", "file:///etc/passwd"] {
            assert!(
                matches!(validate_url(bad), Err(QueueError::InvalidInput(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn detects_known_platforms() {
        assert_eq!(detect_platform("https://www.youtube.com/watch?v=abc"), "YouTube");
        assert_eq!(detect_platform("https://youtu.be/abc"), "YouTube");
        assert_eq!(detect_platform("https://x.com/user/status/1"), "Twitter");
        assert_eq!(detect_platform("https://m.soundcloud.com/a/b"), "SoundCloud");
    }

    #[test]
    fn unknown_hosts_fall_through() {
        assert_eq!(detect_platform("https://example.com/x.com"), "Unknown");
        assert_eq!(detect_platform("https://notx.com/"), "Unknown");
        assert_eq!(detect_platform("garbage"), "Unknown");
    }
}
