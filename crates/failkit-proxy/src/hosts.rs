//! Allow-list of hosts whose traffic is instrumented.
//!
//! Supported pattern forms:
//!
//! - `api.openai.com` matches that host only
//! - `*.stripe.com` matches `stripe.com` and any subdomain at any depth
//! - `*` matches every host
//!
//! Matching ignores case and any `:port` suffix.

use failkit_core::normalize_host;

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Any,
    Exact(String),
    /// Registrable suffix without the leading `*.`.
    Domain(String),
}

impl HostPattern {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        if raw.is_empty() {
            return None;
        }
        if raw == "*" {
            return Some(HostPattern::Any);
        }
        if let Some(domain) = raw.strip_prefix("*.") {
            let domain = normalize_host(domain);
            return (!domain.is_empty()).then_some(HostPattern::Domain(domain));
        }
        Some(HostPattern::Exact(normalize_host(&raw)))
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Any => true,
            HostPattern::Exact(exact) => host == exact,
            HostPattern::Domain(domain) => {
                host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }
        }
    }

    fn as_string(&self) -> String {
        match self {
            HostPattern::Any => "*".to_string(),
            HostPattern::Exact(host) => host.clone(),
            HostPattern::Domain(domain) => format!("*.{domain}"),
        }
    }
}

/// Compiled host allow-list.
#[derive(Debug, Clone, Default)]
pub struct HostMatcher {
    patterns: Vec<HostPattern>,
}

impl HostMatcher {
    /// Compiles the given patterns. Blank entries are ignored.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .filter_map(|p| HostPattern::parse(p.as_ref()))
                .collect(),
        }
    }

    /// Returns true if `host` (optionally with a port) is on the allow-list.
    pub fn is_match(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if host.is_empty() {
            return false;
        }
        self.patterns.iter().any(|p| p.matches(&host))
    }

    /// Returns true if no patterns are configured.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The normalized patterns, in configuration order.
    pub fn patterns(&self) -> Vec<String> {
        self.patterns.iter().map(HostPattern::as_string).collect()
    }
}
