use crate::config::AccountRuleConfig;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// One account-extraction rule: requests under `url_prefix` look for their
/// account in `headers` (first non-empty wins). `*` is the catch-all.
#[derive(Debug, Clone)]
pub struct AccountRule {
    pub url_prefix: String,
    pub headers: Vec<String>,
    pub updated_at_ns: i64,
}

impl From<&AccountRuleConfig> for AccountRule {
    fn from(c: &AccountRuleConfig) -> Self {
        Self {
            url_prefix: c.prefix.clone(),
            headers: c.headers.clone(),
            updated_at_ns: c.updated_at_ns,
        }
    }
}

#[derive(Debug, Clone)]
struct Terminal {
    headers: Vec<String>,
    original_prefix: String,
}

/// A node in the segment trie: host segment at the first level, raw path
/// segments below.
#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    terminal: Option<Terminal>,
}

/// Immutable longest-prefix matcher over `host[/path/...]` rules.
///
/// Built once from a rule set, then shared read-only. The deepest terminal
/// node visited along the walk wins; the `*` rule is the fallback when the
/// walk matches nothing.
#[derive(Debug, Default)]
pub struct AccountMatcher {
    root: Node,
    wildcard_headers: Option<Vec<String>>,
}

/// Normalize a request host for matching: strip any port (bracket-aware),
/// lowercase, and canonicalize IP literals so equivalent spellings collide
/// (`[::1]:8080`, `::1`, `0:0:0:0:0:0:0:1` all normalize to `::1`).
/// Idempotent by construction.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let bare = strip_port(host);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return ip.to_string();
    }
    bare.to_ascii_lowercase()
}

/// Bracket-aware port stripping. An unbracketed multi-colon string is an
/// IPv6 literal without a port, not a `host:port` pair.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
        return host;
    }
    match host.bytes().filter(|&b| b == b':').count() {
        0 => host,
        1 => host.split(':').next().unwrap_or(host),
        _ => host,
    }
}

/// Normalize a rule prefix at build time: trim, reject empties and anything
/// carrying a query, lowercase the host part, keep the path as-is.
/// Returns `None` for invalid prefixes (the rule is dropped).
fn normalize_prefix(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.contains('?') {
        return None;
    }
    if raw == "*" {
        return Some("*".to_string());
    }
    match raw.find('/') {
        Some(i) => {
            let mut out = raw[..i].to_ascii_lowercase();
            out.push_str(&raw[i..]);
            Some(out)
        }
        None => Some(raw.to_ascii_lowercase()),
    }
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    let path = path.split('?').next().unwrap_or("");
    path.trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
}

struct Candidate {
    raw_prefix: String,
    normalized: String,
    headers: Vec<String>,
    updated_at_ns: i64,
}

impl AccountMatcher {
    /// Build a matcher from rules. Rules normalizing to the same prefix are
    /// collapsed to one deterministic winner: newest `updated_at_ns` first,
    /// then ascending raw prefix, then ascending joined header list — the
    /// same result regardless of input order.
    pub fn build(rules: &[AccountRule]) -> Self {
        let mut groups: HashMap<String, Vec<Candidate>> = HashMap::new();
        for rule in rules {
            let Some(normalized) = normalize_prefix(&rule.url_prefix) else {
                tracing::warn!(
                    "matcher: dropping invalid rule prefix, prefix={:?}",
                    rule.url_prefix
                );
                continue;
            };
            groups.entry(normalized.clone()).or_default().push(Candidate {
                raw_prefix: rule.url_prefix.trim().to_string(),
                normalized,
                headers: rule.headers.clone(),
                updated_at_ns: rule.updated_at_ns,
            });
        }

        let mut matcher = AccountMatcher::default();
        for (normalized, mut candidates) in groups {
            candidates.sort_by(|a, b| {
                b.updated_at_ns
                    .cmp(&a.updated_at_ns)
                    .then_with(|| a.raw_prefix.cmp(&b.raw_prefix))
                    .then_with(|| a.headers.join("\0").cmp(&b.headers.join("\0")))
            });
            let winner = candidates.into_iter().next().unwrap();

            if normalized == "*" {
                matcher.wildcard_headers = Some(winner.headers);
                continue;
            }
            matcher.insert(winner);
        }
        matcher
    }

    fn insert(&mut self, c: Candidate) {
        let (host, path) = match c.normalized.find('/') {
            Some(i) => (&c.normalized[..i], &c.normalized[i..]),
            None => (c.normalized.as_str(), ""),
        };

        let mut node = self
            .root
            .children
            .entry(host.to_string())
            .or_default();
        for seg in path_segments(path) {
            node = node.children.entry(seg.to_string()).or_default();
        }
        node.terminal = Some(Terminal {
            headers: c.headers,
            original_prefix: c.raw_prefix,
        });
    }

    /// Longest-prefix lookup. Returns the header list of the deepest rule
    /// covering `(host, path)`, falling back to the wildcard rule.
    pub fn match_headers(&self, host: &str, path: &str) -> Option<Vec<String>> {
        self.match_with_prefix(host, path).map(|(h, _)| h)
    }

    /// Like `match_headers` but also reports which original prefix won
    /// (`"*"` when the wildcard fallback applied).
    pub fn match_with_prefix(&self, host: &str, path: &str) -> Option<(Vec<String>, String)> {
        let host = normalize_host(host);
        let mut deepest: Option<&Terminal> = None;

        if let Some(mut node) = self.root.children.get(host.as_str()) {
            if node.terminal.is_some() {
                deepest = node.terminal.as_ref();
            }
            for seg in path_segments(path) {
                match node.children.get(seg) {
                    Some(child) => {
                        node = child;
                        if node.terminal.is_some() {
                            deepest = node.terminal.as_ref();
                        }
                    }
                    None => break,
                }
            }
        }

        if let Some(t) = deepest {
            return Some((t.headers.clone(), t.original_prefix.clone()));
        }
        self.wildcard_headers
            .as_ref()
            .map(|h| (h.clone(), "*".to_string()))
    }
}

/// Return the first non-empty value among `names` (checked in order).
pub fn extract_account_from_headers(headers: &http::HeaderMap, names: &[String]) -> String {
    for name in names {
        if let Some(v) = headers.get(name.as_str()) {
            if let Ok(s) = v.to_str() {
                if !s.is_empty() {
                    return s.to_string();
                }
            }
        }
    }
    String::new()
}

/// Runtime holder: one atomic pointer to the current matcher. Reads are
/// lock-free; `replace_rules` publishes a freshly built tree.
pub struct MatcherHolder {
    current: ArcSwap<AccountMatcher>,
}

impl Default for MatcherHolder {
    fn default() -> Self {
        Self {
            current: ArcSwap::new(Arc::new(AccountMatcher::default())),
        }
    }
}

impl MatcherHolder {
    pub fn new(matcher: AccountMatcher) -> Self {
        Self {
            current: ArcSwap::new(Arc::new(matcher)),
        }
    }

    pub fn current(&self) -> Arc<AccountMatcher> {
        self.current.load_full()
    }

    pub fn swap(&self, matcher: Arc<AccountMatcher>) {
        self.current.store(matcher);
    }

    pub fn replace_rules(&self, rules: &[AccountRule]) {
        self.swap(Arc::new(AccountMatcher::build(rules)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(prefix: &str, headers: &[&str], updated: i64) -> AccountRule {
        AccountRule {
            url_prefix: prefix.to_string(),
            headers: headers.iter().map(|s| s.to_string()).collect(),
            updated_at_ns: updated,
        }
    }

    fn sample_rules() -> Vec<AccountRule> {
        vec![
            rule("api.example.com", &["Authorization"], 1),
            rule("api.example.com/v1", &["x-api-key"], 1),
            rule("api.example.com/v1/admin", &["x-admin-key"], 1),
            rule("*", &["Authorization", "x-api-key"], 1),
        ]
    }

    #[test]
    fn test_longest_prefix() {
        let m = AccountMatcher::build(&sample_rules());
        assert_eq!(
            m.match_headers("api.example.com", "/v1/admin/users").unwrap(),
            vec!["x-admin-key"]
        );
        assert_eq!(
            m.match_headers("api.example.com", "/v1/other").unwrap(),
            vec!["x-api-key"]
        );
        assert_eq!(
            m.match_headers("api.example.com", "/other").unwrap(),
            vec!["Authorization"]
        );
        assert_eq!(
            m.match_headers("unknown.com", "/anything").unwrap(),
            vec!["Authorization", "x-api-key"]
        );
    }

    #[test]
    fn test_match_with_prefix_reports_winner() {
        let m = AccountMatcher::build(&sample_rules());
        let (_, p) = m.match_with_prefix("api.example.com", "/v1/x").unwrap();
        assert_eq!(p, "api.example.com/v1");
        let (_, p) = m.match_with_prefix("unknown.com", "/").unwrap();
        assert_eq!(p, "*");
    }

    #[test]
    fn test_determinism_regardless_of_order() {
        let mut rules = sample_rules();
        rules.push(rule("API.example.com", &["x-newer"], 2));

        let forward = AccountMatcher::build(&rules);
        rules.reverse();
        let reversed = AccountMatcher::build(&rules);

        for (host, path) in [
            ("api.example.com", "/"),
            ("api.example.com", "/v1/admin/x"),
            ("other.com", "/foo"),
        ] {
            assert_eq!(
                forward.match_headers(host, path),
                reversed.match_headers(host, path),
                "divergence at {host}{path}"
            );
        }
        // The case-variant rule is newer, so it wins its group.
        assert_eq!(
            forward.match_headers("api.example.com", "/plain").unwrap(),
            vec!["x-newer"]
        );
    }

    #[test]
    fn test_conflict_tiebreak_on_raw_prefix() {
        // Same timestamp; winner is the ascending raw prefix.
        let rules = vec![
            rule("API.example.com", &["b-header"], 5),
            rule("api.example.com", &["a-header"], 5),
        ];
        let m = AccountMatcher::build(&rules);
        assert_eq!(
            m.match_headers("api.example.com", "/").unwrap(),
            vec!["b-header"]
        );
    }

    #[test]
    fn test_invalid_prefixes_dropped() {
        let rules = vec![
            rule("", &["a"], 1),
            rule("   ", &["b"], 1),
            rule("host.com?x=1", &["c"], 1),
            rule("host.com", &["d"], 1),
        ];
        let m = AccountMatcher::build(&rules);
        assert_eq!(m.match_headers("host.com", "/").unwrap(), vec!["d"]);
        assert!(m.match_headers("other.com", "/").is_none());
    }

    #[test]
    fn test_host_normalization() {
        assert_eq!(normalize_host("API.Example.COM"), "api.example.com");
        assert_eq!(normalize_host("api.example.com:8080"), "api.example.com");
        assert_eq!(normalize_host("[::1]:8080"), "::1");
        assert_eq!(normalize_host("0:0:0:0:0:0:0:1"), "::1");
        assert_eq!(normalize_host("192.168.0.1:80"), "192.168.0.1");
    }

    #[test]
    fn test_host_normalization_idempotent() {
        for h in [
            "API.Example.COM",
            "[::1]:8080",
            "0:0:0:0:0:0:0:1",
            "192.168.0.1:80",
            "plain.host",
        ] {
            let once = normalize_host(h);
            assert_eq!(normalize_host(&once), once, "not idempotent for {h}");
        }
    }

    #[test]
    fn test_match_ignores_query_and_port() {
        let m = AccountMatcher::build(&sample_rules());
        assert_eq!(
            m.match_headers("api.example.com:443", "/v1/x?key=1").unwrap(),
            vec!["x-api-key"]
        );
    }

    #[test]
    fn test_no_wildcard_no_match() {
        let m = AccountMatcher::build(&[rule("a.com", &["h"], 1)]);
        assert!(m.match_headers("b.com", "/x").is_none());
    }

    #[test]
    fn test_extract_account_first_non_empty() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-api-key", "".parse().unwrap());
        headers.insert("authorization", "acct-9".parse().unwrap());
        let names = vec!["x-api-key".to_string(), "Authorization".to_string()];
        assert_eq!(extract_account_from_headers(&headers, &names), "acct-9");
        assert_eq!(extract_account_from_headers(&http::HeaderMap::new(), &names), "");
    }

    #[test]
    fn test_holder_replace_rules() {
        let holder = MatcherHolder::default();
        assert!(holder.current().match_headers("a.com", "/").is_none());
        holder.replace_rules(&[rule("a.com", &["h"], 1)]);
        assert_eq!(holder.current().match_headers("a.com", "/").unwrap(), vec!["h"]);
    }
}
