use regex::Regex;
use std::sync::LazyLock;

/// Matches `url(...)` with a bare, single-quoted or double-quoted argument.
/// Group 1: double-quoted inner, group 2: single-quoted inner, group 3: bare.
static CSS_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^"')][^)]*|))\s*\)"#)
        .expect("css url pattern is valid")
});

fn inner_of<'a>(caps: &'a regex::Captures<'a>) -> &'a str {
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str())
        .unwrap_or("")
        .trim()
}

fn is_data_url(target: &str) -> bool {
    target.len() >= 5 && target[..5].eq_ignore_ascii_case("data:")
}

/// Collect the referenced targets of every `url(...)` in a stylesheet.
/// `data:` URIs are embedded content, not fetchable references, and are
/// skipped along with empty arguments.
pub fn find_urls(css: &str) -> Vec<String> {
    CSS_URL_RE
        .captures_iter(css)
        .map(|caps| inner_of(&caps).to_string())
        .filter(|target| !target.is_empty() && !is_data_url(target))
        .collect()
}

/// Rewrite `url(...)` occurrences whose trimmed inner value maps to a
/// replacement. Matches with no replacement (including `data:` URIs) are
/// left byte-for-byte as they were. Replacements are emitted unquoted.
pub fn rewrite_urls<F>(css: &str, replacement_for: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    CSS_URL_RE
        .replace_all(css, |caps: &regex::Captures<'_>| {
            let target = inner_of(caps);
            if target.is_empty() || is_data_url(target) {
                return caps[0].to_string();
            }
            match replacement_for(target) {
                Some(local) => format!("url({local})"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
