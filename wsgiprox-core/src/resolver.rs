//! Pluggable URL rewriting: the step between "a normalized request for
//! `example.com/page`" and "the URL the downstream app should actually see".

use http::{HeaderMap, Uri};

/// Context available to a resolver beyond the bare request URL — mirrors
/// what the WSGI environ would expose for this decision (spec §3.2).
pub struct ResolveContext<'a> {
    pub headers: &'a HeaderMap,
}

/// Rewrites a fully-qualified request URL (e.g. `https://example.com/page`)
/// into the URL the downstream application should see. Implementations must
/// be idempotent on their own output: resolving an already-resolved URL
/// again returns it unchanged (spec §3.2 invariant).
pub trait UrlResolver: Send + Sync {
    fn resolve(&self, url: &str, context: &ResolveContext<'_>) -> String;
}

impl<F> UrlResolver for F
where
    F: Fn(&str, &ResolveContext<'_>) -> String + Send + Sync,
{
    fn resolve(&self, url: &str, context: &ResolveContext<'_>) -> String {
        self(url, context)
    }
}

/// Prepends a fixed prefix to every URL, except for hosts in `identity_hosts`
/// (and except for URLs that already carry the prefix), which pass through
/// unchanged. The default resolver (spec §3.2).
pub struct FixedResolver {
    prefix: String,
    identity_hosts: Vec<String>,
}

impl FixedResolver {
    /// `prefix` is normalized at construction: any trailing `/` is stripped
    /// so joining never produces a doubled slash, regardless of whether the
    /// caller passed `http://replay/` or `http://replay`.
    pub fn new(prefix: impl Into<String>, identity_hosts: Vec<String>) -> Self {
        let mut prefix = prefix.into();
        while prefix.ends_with('/') {
            prefix.pop();
        }
        FixedResolver { prefix, identity_hosts }
    }

    fn is_identity_host(&self, host: &str) -> bool {
        self.identity_hosts.iter().any(|h| h == host)
    }
}

impl UrlResolver for FixedResolver {
    fn resolve(&self, url: &str, _context: &ResolveContext<'_>) -> String {
        if let Ok(parsed) = url.parse::<Uri>() {
            if let Some(host) = parsed.host() {
                if self.is_identity_host(host) {
                    return match parsed.path_and_query() {
                        Some(pq) => pq.to_string(),
                        None => parsed.path().to_string(),
                    };
                }
            }
        }
        if url.starts_with(&format!("{}/", self.prefix)) {
            return url.to_string();
        }
        format!("{}/{}", self.prefix, url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_generic_url() {
        let resolver = FixedResolver::new("http://localhost:8080/replay/20200101000000", vec![]);
        let headers = HeaderMap::new();
        let out = resolver.resolve("https://example.com/page", &ResolveContext { headers: &headers });
        assert_eq!(out, "http://localhost:8080/replay/20200101000000/https://example.com/page");
    }

    #[test]
    fn normalizes_trailing_slash_in_prefix() {
        let resolver = FixedResolver::new("http://localhost:8080/replay/20200101000000/", vec![]);
        let headers = HeaderMap::new();
        let out = resolver.resolve("https://example.com/page", &ResolveContext { headers: &headers });
        assert_eq!(out, "http://localhost:8080/replay/20200101000000/https://example.com/page");
    }

    #[test]
    fn identity_host_resolves_to_bare_path_and_query() {
        let resolver = FixedResolver::new("http://localhost:8080/replay/", vec!["wsgiprox".to_string()]);
        let headers = HeaderMap::new();
        let out = resolver.resolve("http://wsgiprox/path/file?foo=bar", &ResolveContext { headers: &headers });
        assert_eq!(out, "/path/file?foo=bar");
    }

    #[test]
    fn identity_host_with_no_query_omits_question_mark() {
        let resolver = FixedResolver::new("http://localhost:8080/replay/", vec!["wsgiprox".to_string()]);
        let headers = HeaderMap::new();
        let out = resolver.resolve("http://wsgiprox/path/file", &ResolveContext { headers: &headers });
        assert_eq!(out, "/path/file");
    }

    #[test]
    fn identity_host_match_requires_exact_host_not_prefix() {
        let resolver = FixedResolver::new("http://localhost:8080/replay/", vec!["wsgiprox".to_string()]);
        let headers = HeaderMap::new();
        let out = resolver.resolve("http://wsgiprox.evil.example/path", &ResolveContext { headers: &headers });
        assert_eq!(out, "http://localhost:8080/replay/http://wsgiprox.evil.example/path");
    }

    #[test]
    fn resolving_twice_is_idempotent() {
        let resolver = FixedResolver::new("http://localhost:8080/replay/20200101000000", vec![]);
        let headers = HeaderMap::new();
        let once = resolver.resolve("https://example.com/page", &ResolveContext { headers: &headers });
        let twice = resolver.resolve(&once, &ResolveContext { headers: &headers });
        assert_eq!(once, twice);
    }
}
