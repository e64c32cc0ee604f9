// src/headers.rs
//
// Request headers are kept as byte ranges into the connection's inbound
// buffer, in received order. Values only become owned when duplicate
// list-semantics headers are merged with a comma.

/// A resolved-on-demand string slice: either a range of the inbound
/// buffer or an owned merge product.
#[derive(Debug, Clone)]
pub enum Span {
    Buf { start: usize, end: usize },
    Owned(String),
}

impl Span {
    pub fn resolve<'a>(&'a self, buf: &'a [u8]) -> &'a str {
        match self {
            // Validated as UTF-8 during head parsing.
            Span::Buf { start, end } => std::str::from_utf8(&buf[*start..*end]).unwrap_or(""),
            Span::Owned(s) => s.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeaderEntry {
    pub name: Span,
    pub value: Span,
}

/// Ordered header table for one parsed request head.
#[derive(Debug, Clone, Default)]
pub struct HeaderTable {
    pub entries: Vec<HeaderEntry>,
}

impl HeaderTable {
    /// First value for `name`. Exact-case comparison first (the common
    /// case: callers use the canonical casing clients send), then a
    /// case-insensitive linear fallback.
    pub fn find<'a>(&'a self, buf: &'a [u8], name: &str) -> Option<&'a str> {
        for entry in &self.entries {
            if entry.name.resolve(buf) == name {
                return Some(entry.value.resolve(buf));
            }
        }
        for entry in &self.entries {
            if entry.name.resolve(buf).eq_ignore_ascii_case(name) {
                return Some(entry.value.resolve(buf));
            }
        }
        None
    }

    pub fn iter<'a>(&'a self, buf: &'a [u8]) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.entries
            .iter()
            .map(move |e| (e.name.resolve(buf), e.value.resolve(buf)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Duplicate-header policy per RFC 9110 field semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Second occurrence is a protocol error (400).
    Singleton,
    /// Occurrences merge with ", " preserving order.
    List,
    /// Policy depends on `merge_unknown_request_headers`.
    Unknown,
}

/// Curated field table. Anything absent is `Unknown`.
pub fn duplicate_policy(name: &str) -> DuplicatePolicy {
    const SINGLETONS: [&str; 12] = [
        "host",
        "content-length",
        "transfer-encoding",
        "content-type",
        "authorization",
        "expect",
        "from",
        "if-modified-since",
        "if-unmodified-since",
        "max-forwards",
        "referer",
        "user-agent",
    ];
    const LISTS: [&str; 18] = [
        "accept",
        "accept-charset",
        "accept-encoding",
        "accept-language",
        "cache-control",
        "connection",
        "content-encoding",
        "content-language",
        "cookie",
        "forwarded",
        "if-match",
        "if-none-match",
        "pragma",
        "te",
        "trailer",
        "upgrade",
        "via",
        "warning",
    ];
    let lower = name.to_ascii_lowercase();
    if SINGLETONS.contains(&lower.as_str()) {
        DuplicatePolicy::Singleton
    } else if LISTS.contains(&lower.as_str()) {
        DuplicatePolicy::List
    } else {
        DuplicatePolicy::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(usize, usize, usize, usize)]) -> HeaderTable {
        HeaderTable {
            entries: pairs
                .iter()
                .map(|&(ns, ne, vs, ve)| HeaderEntry {
                    name: Span::Buf { start: ns, end: ne },
                    value: Span::Buf { start: vs, end: ve },
                })
                .collect(),
        }
    }

    #[test]
    fn test_find_is_case_insensitive_first_value() {
        let buf = b"Host: a\r\nhost2: b\r\nHOST: c";
        let t = table(&[(0, 4, 6, 7), (9, 14, 16, 17), (19, 23, 25, 26)]);
        assert_eq!(t.find(buf, "Host"), Some("a"));
        assert_eq!(t.find(buf, "hOsT"), Some("a"));
        assert_eq!(t.find(buf, "host2"), Some("b"));
        assert_eq!(t.find(buf, "missing"), None);
    }

    #[test]
    fn test_duplicate_policy_table() {
        assert_eq!(duplicate_policy("Host"), DuplicatePolicy::Singleton);
        assert_eq!(duplicate_policy("content-length"), DuplicatePolicy::Singleton);
        assert_eq!(duplicate_policy("Accept-Encoding"), DuplicatePolicy::List);
        assert_eq!(duplicate_policy("X-Custom"), DuplicatePolicy::Unknown);
    }
}
