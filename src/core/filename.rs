use regex::Regex;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const MAX_STEM_CHARS: usize = 200;
const FALLBACK_ID_CHARS: usize = 8;

/// Reduces a media title to `[A-Za-z0-9 _-]`. Accented letters are folded to
/// their base letter first so "Café" becomes "Cafe" rather than "Caf".
pub fn sanitize_title(title: &str) -> String {
    let folded: String = title
        .nfkd()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-') || c.is_whitespace())
        .collect();
    let collapsed = WS_RE.replace_all(&folded, " ");
    let trimmed = collapsed.trim().trim_end_matches([' ', '-']);

    trimmed.chars().take(MAX_STEM_CHARS).collect::<String>().trim_end().to_string()
}

/// File stem for a download: the sanitized title, or `download_<id prefix>`
/// when nothing usable survives sanitizing.
pub fn file_stem(title: &str, id: &str) -> String {
    let stem = sanitize_title(title);
    if stem.is_empty() {
        let prefix: String = id.chars().take(FALLBACK_ID_CHARS).collect();
        format!("download_{}", prefix)
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_forbidden_chars() {
        assert_eq!(sanitize_title("a:b?c/d"), "abcd");
    }

    #[test]
    fn sanitize_keeps_allowed_set() {
        assert_eq!(sanitize_title("My_Video - Part 2"), "My_Video - Part 2");
    }

    #[test]
    fn sanitize_collapses_whitespace() {
        assert_eq!(sanitize_title("hello \t  world"), "hello world");
    }

    #[test]
    fn sanitize_trims_trailing_separators() {
        assert_eq!(sanitize_title("file name - "), "file name");
    }

    #[test]
    fn sanitize_folds_accents() {
        assert_eq!(sanitize_title("Café Déjà vu"), "Cafe Deja vu");
    }

    #[test]
    fn sanitize_limits_length() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_title(&long).len(), MAX_STEM_CHARS);
    }

    #[test]
    fn stem_falls_back_to_id_prefix() {
        assert_eq!(file_stem("???", "0123456789ab"), "download_01234567");
        assert_eq!(file_stem("", "abc"), "download_abc");
        assert_eq!(file_stem("日本語", "feedfacecafe"), "download_feedface");
    }

    #[test]
    fn stem_uses_title_when_present() {
        assert_eq!(file_stem("Video: \"Best of 2024\" <HD>", "x"), "Video Best of 2024 HD");
    }
}
