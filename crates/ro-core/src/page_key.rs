//! Content-identity keys for deduplicating referral processing.

use std::fmt;

use crate::config::EngineConfig;
use crate::url::{query_pairs, split_url};

/// Identifies a logical page independent of its referral value and tab.
///
/// Two URLs that only differ in the `ref` value, query order or a trailing
/// tab segment (`/owners`, `/history`, ...) map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey(String);

impl PageKey {
    /// Compute the key for `url` using the configured tab suffixes and
    /// referral parameter.
    pub fn compute(url: &str, config: &EngineConfig) -> Self {
        Self::compute_with(url, &config.referral_param, &config.tab_suffixes)
    }

    pub fn compute_with<S: AsRef<str>>(url: &str, referral_param: &str, tab_suffixes: &[S]) -> Self {
        let parts = split_url(url);
        let path = strip_tab_suffix(parts.path, tab_suffixes);

        let mut pairs: Vec<(String, String)> = parts
            .query
            .map(query_pairs)
            .unwrap_or_default()
            .into_iter()
            .filter(|(k, _)| k != referral_param)
            .collect();
        pairs.sort();

        if pairs.is_empty() {
            return Self(path.to_string());
        }

        let query = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        Self(format!("{path}?{query}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remove one trailing tab segment, e.g. `/tokens/KT1/5/owners` -> `/tokens/KT1/5`.
pub fn strip_tab_suffix<'a, S: AsRef<str>>(path: &'a str, tab_suffixes: &[S]) -> &'a str {
    let Some(slash) = path.rfind('/') else {
        return path;
    };
    let last = &path[slash + 1..];
    if slash > 0 && tab_suffixes.iter().any(|s| s.as_ref() == last) {
        &path[..slash]
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(url: &str) -> PageKey {
        PageKey::compute(url, &EngineConfig::default())
    }

    #[test]
    fn ignores_ref_value_and_query_order() {
        assert_eq!(key("/tokens/KT1abc/5?x=1&ref=A"), key("/tokens/KT1abc/5?ref=B&x=1"));
        assert_eq!(key("https://objkt.com/tokens/KT1abc/5?x=1&ref=A").as_str(), "/tokens/KT1abc/5?x=1");
    }

    #[test]
    fn ignores_tab_suffix() {
        assert_eq!(key("/tokens/KT1abc/5/owners"), key("/tokens/KT1abc/5"));
        assert_eq!(key("/tokens/KT1abc/5/activities?ref=x"), key("/tokens/KT1abc/5"));
        // only known tabs are stripped
        assert_ne!(key("/tokens/KT1abc/5/details"), key("/tokens/KT1abc/5"));
    }

    #[test]
    fn distinguishes_content() {
        assert_ne!(key("/tokens/KT1abc/5"), key("/tokens/KT1abc/6"));
        assert_ne!(key("/explore?page=1"), key("/explore?page=2"));
    }

    #[test]
    fn sorts_decoded_pairs() {
        assert_eq!(key("/explore?b=2&a=%31").as_str(), "/explore?a=1&b=2");
        assert_eq!(key("/explore?ref=only").as_str(), "/explore");
    }

    #[test]
    fn strips_only_one_segment() {
        let tabs = ["owners"];
        assert_eq!(strip_tab_suffix("/a/owners/owners", &tabs), "/a/owners");
        assert_eq!(strip_tab_suffix("/owners", &tabs), "/owners");
    }
}
