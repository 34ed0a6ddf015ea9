//! Browser-like request headers with a rotating user agent.

use rand::seq::IndexedRandom;

/// Desktop and mobile user agents of current mainstream browsers.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:131.0) Gecko/20100101 Firefox/131.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36 Edg/129.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.7; rv:131.0) Gecko/20100101 Firefox/131.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:131.0) Gecko/20100101 Firefox/131.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Mobile Safari/537.36",
];

/// Pick a user agent uniformly at random.
pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Header set for one attempt.
///
/// A fixed `user_agent` override wins over rotation. Accept-Encoding is left
/// to the HTTP client so it can decompress transparently.
pub fn browser_headers(user_agent: Option<&str>) -> Vec<(&'static str, String)> {
    let ua = match user_agent {
        Some(ua) => ua,
        None => random_user_agent(),
    };
    vec![
        ("user-agent", ua.to_string()),
        (
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,application/json,*/*;q=0.8"
                .to_string(),
        ),
        ("accept-language", "en-US,en;q=0.9".to_string()),
        ("upgrade-insecure-requests", "1".to_string()),
        ("sec-fetch-dest", "document".to_string()),
        ("sec-fetch-mode", "navigate".to_string()),
        ("sec-fetch-site", "none".to_string()),
        ("cache-control", "max-age=0".to_string()),
        ("dnt", "1".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn random_user_agent_comes_from_table() {
        for _ in 0..20 {
            assert!(USER_AGENTS.contains(&random_user_agent()));
        }
    }

    #[test]
    fn random_user_agent_rotates() {
        let seen: HashSet<_> = (0..100).map(|_| random_user_agent()).collect();
        assert!(seen.len() >= 2, "user agent never rotated");
    }

    #[test]
    fn override_pins_user_agent() {
        let headers = browser_headers(Some("hearth-test/1.0"));
        assert_eq!(headers[0], ("user-agent", "hearth-test/1.0".to_string()));
        assert!(headers.iter().all(|(k, _)| *k != "accept-encoding"));
    }

    #[test]
    fn override_accepts_borrowed_user_agent() {
        let configured = format!("hearth/{}", 2);
        let headers = browser_headers(Some(configured.as_str()));
        drop(configured);
        assert_eq!(headers[0].1, "hearth/2");
    }

    #[test]
    fn no_override_rotates_from_table() {
        let headers = browser_headers(None);
        assert!(USER_AGENTS.contains(&headers[0].1.as_str()));
    }
}
