//! The normalized request: a typed view of one HTTP request as handed to
//! the downstream application, independent of whether it arrived as a
//! plain-HTTP proxy request or was decrypted off an intercepted TLS tunnel.

use std::collections::HashMap;
use std::pin::Pin;

use tokio::io::AsyncRead;

/// `REQUEST_URI`/`PATH_INFO`/`QUERY_STRING` reconstruction is an invariant
/// the downstream app relies on (spec §3, §8 invariant 1/2).
pub type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlScheme {
    Http,
    Https,
}

impl UrlScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            UrlScheme::Http => "http",
            UrlScheme::Https => "https",
        }
    }
}

pub struct NormalizedRequest {
    pub method: String,
    pub request_uri: String,
    pub path_info: String,
    pub query_string: String,
    pub server_protocol: String,
    pub url_scheme: UrlScheme,

    /// Present only for requests that arrived over an intercepted tunnel.
    pub proxy_scheme: Option<UrlScheme>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,

    /// Folded headers: `HTTP_X_Y_Z` for every header except `Content-Length`
    /// and `Content-Type`, which keep their unprefixed folded names.
    pub headers: HashMap<String, String>,

    pub body: BodyReader,
}

impl NormalizedRequest {
    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("CONTENT_LENGTH").and_then(|v| v.parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("CONTENT_TYPE").map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&fold_header_name(name)).map(String::as_str)
    }

    /// Splits a combined `path?query` effective URL path into
    /// `(PATH_INFO, QUERY_STRING)` — the pair that reconstructs
    /// `REQUEST_URI` (spec §3 invariant).
    pub fn split_path_and_query(path_and_query: &str) -> (String, String) {
        match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (path_and_query.to_string(), String::new()),
        }
    }
}

/// Header folding rule (spec §3): lowercase -> uppercase, `-` -> `_`, every
/// header except `Content-Length`/`Content-Type` gets an `HTTP_` prefix.
pub fn fold_header_name(name: &str) -> String {
    let folded = name.to_ascii_uppercase().replace('-', "_");
    match folded.as_str() {
        "CONTENT_LENGTH" | "CONTENT_TYPE" => folded,
        _ => format!("HTTP_{folded}"),
    }
}

/// Folds an iterator of raw header pairs into the map `NormalizedRequest`
/// carries. Later duplicate headers overwrite earlier ones, matching a
/// single-valued environ-style mapping.
pub fn fold_headers<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in pairs {
        map.insert(fold_header_name(name), value.to_string());
    }
    map
}
