//! User-agent based bot detection.

use regex::Regex;
use std::sync::LazyLock;

/// Substrings that mark a user agent as automated traffic
pub const BOT_TOKENS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "slurp",
    "googlebot",
    "bingbot",
    "yandex",
    "baiduspider",
    "duckduckbot",
    "facebookexternalhit",
    "headless",
    "phantomjs",
    "lighthouse",
    "pingdom",
    "curl",
    "wget",
    "python-requests",
];

static BOT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    let alternation = BOT_TOKENS
        .iter()
        .map(|token| regex::escape(token))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("(?i)(?:{alternation})")).expect("Invalid regex")
});

/// Case-insensitive token match; a missing or blank user agent is not a bot
pub fn is_bot(user_agent: Option<&str>) -> bool {
    user_agent
        .map(str::trim)
        .filter(|ua| !ua.is_empty())
        .is_some_and(|ua| BOT_PATTERN.is_match(ua))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_crawlers() {
        assert!(is_bot(Some(
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)"
        )));
        assert!(is_bot(Some("Mozilla/5.0 HeadlessChrome/120.0")));
        assert!(is_bot(Some("facebookexternalhit/1.1")));
        assert!(is_bot(Some("Yahoo! Slurp")));
    }

    #[test]
    fn test_browsers_are_not_bots() {
        assert!(!is_bot(Some(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0) AppleWebKit/605.1.15 Safari/605.1.15"
        )));
        assert!(!is_bot(None));
        assert!(!is_bot(Some("   ")));
    }
}
