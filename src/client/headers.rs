//! Insertion-ordered HTTP header collection.
//!
//! `http::HeaderMap` keeps multi-value ordering but normalises names, and
//! plain maps lose ordering entirely. Fingerprint checks profile both the
//! relative ordering of headers (`accept-language` after `sec-ch-ua-*`,
//! `user-agent` position, …) and their casing, so sessions build their
//! header set here and materialise it right before dispatch.
//!
//! Names are stored with the exact casing the caller supplied; matching is
//! case-insensitive. On the wire hyper emits lowercase names (HTTP/2
//! requires this), so casing fidelity applies to storage and lookups while
//! ordering fidelity applies end to end.
//!
//! Not internally synchronised: each session owns one `OrderedHeaderMap`
//! behind its own lock.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use once_cell::sync::Lazy;

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderEntry {
    name: String,
    value: String,
}

/// Ordered header list preserving exact casing and insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedHeaderMap {
    entries: Vec<HeaderEntry>,
}

impl OrderedHeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a name/value pair, preserving the exact casing of `name`.
    /// Repeated calls with the same name produce multiple entries.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(HeaderEntry {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replaces the first entry matching `name` (case-insensitively) and
    /// removes any later duplicates. The surviving entry takes `name`'s
    /// casing, so `set` can also be used to re-case a header. Behaves like
    /// `add` when no entry matches.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let mut replaced = false;
        self.entries.retain_mut(|entry| {
            if entry.name.eq_ignore_ascii_case(&name) {
                if replaced {
                    return false;
                }
                entry.name = name.clone();
                entry.value = value.clone();
                replaced = true;
            }
            true
        });
        if !replaced {
            self.entries.push(HeaderEntry { name, value });
        }
    }

    /// Removes every entry matching `name`, case-insensitively.
    pub fn del(&mut self, name: &str) {
        self.entries.retain(|entry| !entry.name.eq_ignore_ascii_case(name));
    }

    /// Returns the value of the first entry matching `name`,
    /// case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
            .map(|entry| entry.value.as_str())
    }

    /// Number of entries, duplicates included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order as (name, value) pairs with the
    /// stored casing.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|entry| (entry.name.as_str(), entry.value.as_str()))
    }

    /// Materialises the collection into an `http::HeaderMap` in insertion
    /// order. Entries whose name or value cannot be represented are skipped;
    /// the set is caller-controlled so this only drops genuinely malformed
    /// input.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for entry in &self.entries {
            let name = match HeaderName::from_bytes(entry.name.as_bytes()) {
                Ok(name) => name,
                Err(_) => continue,
            };
            let value = match HeaderValue::from_str(&entry.value) {
                Ok(value) => value,
                Err(_) => continue,
            };
            map.append(name, value);
        }
        map
    }

    /// Overlays `other` on top of `self`: every entry in `other` replaces
    /// same-named entries via `set`, so caller-supplied headers win over a
    /// base layer.
    pub fn merge(&mut self, other: &OrderedHeaderMap) {
        for (name, value) in other.iter() {
            self.set(name, value);
        }
    }
}

static CHROME_HEADERS: Lazy<OrderedHeaderMap> = Lazy::new(build_chrome_headers);

/// The Chrome 120 Windows request header set, in the exact order a real
/// client sends it. Applied as the base layer on every session; callers
/// override individual entries with `set` afterwards.
pub fn chrome_headers() -> OrderedHeaderMap {
    CHROME_HEADERS.clone()
}

fn build_chrome_headers() -> OrderedHeaderMap {
    let mut h = OrderedHeaderMap::new();
    h.add("sec-ch-ua", r#""Not_A Brand";v="8", "Chromium";v="120", "Google Chrome";v="120""#);
    h.add("sec-ch-ua-mobile", "?0");
    h.add("sec-ch-ua-platform", r#""Windows""#);
    h.add("Upgrade-Insecure-Requests", "1");
    h.add(
        "User-Agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    );
    h.add(
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
    );
    h.add("sec-fetch-site", "none");
    h.add("sec-fetch-mode", "navigate");
    h.add("sec-fetch-user", "?1");
    h.add("sec-fetch-dest", "document");
    h.add("accept-encoding", "gzip, deflate, br");
    h.add("accept-language", "en-US,en;q=0.9");
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_preserves_order_and_duplicates() {
        let mut h = OrderedHeaderMap::new();
        h.add("X-First", "1");
        h.add("X-Second", "2");
        h.add("X-First", "3");
        let order: Vec<_> = h.iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(order, ["X-First", "X-Second", "X-First"]);
    }

    #[test]
    fn set_replaces_first_and_dedups_rest() {
        let mut h = OrderedHeaderMap::new();
        h.add("User-Agent", "old");
        h.add("Accept", "*/*");
        h.add("user-agent", "older");
        h.set("user-AGENT", "new");
        assert_eq!(h.len(), 2);
        assert_eq!(h.get("User-Agent"), Some("new"));
        // Surviving entry takes the Set casing and keeps the original slot.
        let first = h.iter().next().unwrap();
        assert_eq!(first, ("user-AGENT", "new"));
    }

    #[test]
    fn del_and_get_are_case_insensitive() {
        let mut h = OrderedHeaderMap::new();
        h.add("Authorization", "Bearer x");
        assert_eq!(h.get("authorization"), Some("Bearer x"));
        h.del("AUTHORIZATION");
        assert!(h.get("Authorization").is_none());
        assert!(h.is_empty());
    }

    #[test]
    fn materialises_in_insertion_order() {
        let mut h = OrderedHeaderMap::new();
        h.add("b-header", "2");
        h.add("a-header", "1");
        let map = h.to_header_map();
        let names: Vec<_> = map.keys().map(|k| k.as_str().to_string()).collect();
        assert_eq!(names, ["b-header", "a-header"]);
    }

    #[test]
    fn chrome_set_starts_with_client_hints() {
        let h = chrome_headers();
        let first = h.iter().next().unwrap().0;
        assert_eq!(first, "sec-ch-ua");
        assert!(h.get("User-Agent").unwrap().contains("Chrome/120"));
    }
}
