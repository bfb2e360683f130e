// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cache key

use super::*;

use blake2::{Blake2b, Digest};
use hoard_error::{Error, ErrorType::*, OkOrErr, OrErr};
use http::uri::Authority;
use std::fmt::{Display, Formatter, Result as FmtResult};

// 16-byte / 128-bit key: large enough to avoid collision
const KEY_SIZE: usize = 16;

/// An 128 bit hash binary
pub type HashBinary = [u8; KEY_SIZE];

pub(crate) type Blake2b128 = Blake2b<blake2::digest::consts::U16>;

/// Whether requests with this method can be looked up in or stored to the cache.
///
/// HEAD shares the key of GET so a HEAD can be answered from a stored GET.
pub fn method_keyable(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD)
}

/// The URL components a [CacheKey] is derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    /// lowercase scheme
    pub scheme: String,
    /// lowercase host
    pub host: String,
    /// explicit port, or the default port of the scheme
    pub port: u16,
    /// the path, `/` when the request has none
    pub path: String,
    /// the query string after session id removal, `None` when empty or ignored
    pub query: Option<String>,
}

impl UrlParts {
    /// Collect the URL of the request.
    ///
    /// The host comes from the request target when it is in absolute form, otherwise from the
    /// `Host` header. The scheme defaults to `http` for origin-form targets.
    pub fn from_request(req: &ReqHeader) -> Result<Self> {
        let scheme = req.uri.scheme_str().unwrap_or("http").to_ascii_lowercase();

        let authority = match req.uri.authority() {
            Some(a) => a.clone(),
            None => {
                let host = req
                    .headers
                    .get(http::header::HOST)
                    .or_err(KeyNormalizationError, "request has no host")?;
                let host = host
                    .to_str()
                    .or_err(KeyNormalizationError, "host header is not visible ascii")?;
                host.parse::<Authority>().or_err_with(KeyNormalizationError, || {
                    format!("invalid host header {host:?}")
                })?
            }
        };
        let host = authority.host();
        if host.is_empty() {
            return Error::e_explain(KeyNormalizationError, "request has an empty host");
        }
        let port = match authority.port_u16() {
            Some(p) => p,
            None => default_port(&scheme).or_err_with(KeyNormalizationError, || {
                format!("no default port for scheme {scheme}")
            })?,
        };

        let path = match req.uri.path() {
            "" => "/",
            p => p,
        };
        let query = req.uri.query().filter(|q| !q.is_empty());

        Ok(UrlParts {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
            path: path.to_string(),
            query: query.map(|q| q.to_string()),
        })
    }

    /// Drop `name=value` tokens of the given names from the query and from `;` path
    /// parameters.
    pub fn strip_session_ids(&mut self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        self.path = strip_path_session_ids(&self.path, ids);
        if let Some(q) = self.query.take() {
            let stripped = strip_query_session_ids(&q, ids);
            if !stripped.is_empty() {
                self.query = Some(stripped);
            }
        }
    }

    /// Produce the canonical key: `scheme://host:port/path[?query]`
    pub fn cache_key(&self) -> CacheKey {
        let mut key = format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path);
        if let Some(q) = self.query.as_ref() {
            key.push('?');
            key.push_str(q);
        }
        CacheKey { key }
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

fn strip_path_session_ids(path: &str, ids: &[String]) -> String {
    let mut out = path.to_string();
    for id in ids {
        let needle = format!(";{id}=");
        while let Some(start) = out.find(&needle) {
            let value_start = start + needle.len();
            let end = out[value_start..]
                .find(|c: char| c == ';' || c == '/')
                .map_or(out.len(), |i| value_start + i);
            out.replace_range(start..end, "");
        }
    }
    out
}

fn strip_query_session_ids(query: &str, ids: &[String]) -> String {
    query
        .split('&')
        .filter(|token| {
            !token.is_empty()
                && !ids.iter().any(|id| {
                    token
                        .strip_prefix(id.as_str())
                        .is_some_and(|rest| rest.starts_with('='))
                })
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// The canonical identity of a cached resource
///
/// Two requests for equivalent URLs produce equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key: String,
}

impl CacheKey {
    /// Wrap an already canonical key string.
    pub fn new<S: Into<String>>(key: S) -> Self {
        CacheKey { key: key.into() }
    }

    /// Build the key of the request under the given configuration.
    ///
    /// Fails with `KeyNormalizationError` when the URL cannot be made canonical.
    pub fn from_request(req: &ReqHeader, conf: &CacheConf) -> Result<Self> {
        Ok(normalize(req, conf)?.cache_key())
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The 128 bit hash of the key
    pub fn hash_bin(&self) -> HashBinary {
        let mut hasher = Blake2b128::new();
        hasher.update(self.key.as_bytes());
        hasher.finalize().into()
    }

    /// The hex string of [Self::hash_bin()]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash_bin())
    }

    pub(crate) fn lock_id(&self) -> u128 {
        u128::from_be_bytes(self.hash_bin())
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.key)
    }
}

/// Normalize the URL of the request, applying the query string and session id rules of `conf`.
pub fn normalize(req: &ReqHeader, conf: &CacheConf) -> Result<UrlParts> {
    let mut parts = UrlParts::from_request(req)?;
    if conf.ignore_query_string {
        parts.query = None;
    }
    parts.strip_session_ids(&conf.ignore_session_ids);
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(uri: &str) -> ReqHeader {
        http::Request::builder()
            .uri(uri)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    fn req_with_host(uri: &str, host: &str) -> ReqHeader {
        http::Request::builder()
            .uri(uri)
            .header("Host", host)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn test_absolute_form() {
        let conf = CacheConf::default();
        let key = CacheKey::from_request(&req("http://Example.COM/a/b?x=1"), &conf).unwrap();
        assert_eq!(key.as_str(), "http://example.com:80/a/b?x=1");

        let key = CacheKey::from_request(&req("https://example.com:8443"), &conf).unwrap();
        assert_eq!(key.as_str(), "https://example.com:8443/");
    }

    #[test]
    fn test_host_header() {
        let conf = CacheConf::default();
        let key = CacheKey::from_request(&req_with_host("/p", "Example.com"), &conf).unwrap();
        assert_eq!(key.as_str(), "http://example.com:80/p");

        let key = CacheKey::from_request(&req_with_host("/p", "example.com:8080"), &conf).unwrap();
        assert_eq!(key.as_str(), "http://example.com:8080/p");
    }

    #[test]
    fn test_equivalent_urls() {
        let conf = CacheConf::default();
        let a = CacheKey::from_request(&req("http://example.com/p"), &conf).unwrap();
        let b = CacheKey::from_request(&req("HTTP://EXAMPLE.com:80/p"), &conf).unwrap();
        let c = CacheKey::from_request(&req_with_host("/p", "example.com"), &conf).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.hash_bin(), c.hash_bin());
        assert_eq!(a.hash_hex().len(), KEY_SIZE * 2);
    }

    #[test]
    fn test_no_host() {
        let conf = CacheConf::default();
        let err = CacheKey::from_request(&req("/p"), &conf).unwrap_err();
        assert_eq!(err.etype(), &KeyNormalizationError);
    }

    #[test]
    fn test_unknown_scheme_needs_port() {
        let conf = CacheConf::default();
        assert!(CacheKey::from_request(&req("ftp://example.com/p"), &conf).is_err());
        let key = CacheKey::from_request(&req("ftp://example.com:21/p"), &conf).unwrap();
        assert_eq!(key.as_str(), "ftp://example.com:21/p");
    }

    #[test]
    fn test_ignore_query_string() {
        let conf = CacheConf {
            ignore_query_string: true,
            ..Default::default()
        };
        let key = CacheKey::from_request(&req("http://example.com/p?a=1"), &conf).unwrap();
        assert_eq!(key.as_str(), "http://example.com:80/p");
    }

    #[test]
    fn test_session_ids_in_query() {
        let conf = CacheConf {
            ignore_session_ids: vec!["sid".to_string()],
            ..Default::default()
        };
        let key =
            CacheKey::from_request(&req("http://example.com/p?a=1&sid=XYZ&b=2"), &conf).unwrap();
        assert_eq!(key.as_str(), "http://example.com:80/p?a=1&b=2");

        let key = CacheKey::from_request(&req("http://example.com/p?sid=XYZ"), &conf).unwrap();
        assert_eq!(key.as_str(), "http://example.com:80/p");

        // only exact names are removed
        let key = CacheKey::from_request(&req("http://example.com/p?sidx=1"), &conf).unwrap();
        assert_eq!(key.as_str(), "http://example.com:80/p?sidx=1");
    }

    #[test]
    fn test_session_ids_in_path() {
        let conf = CacheConf {
            ignore_session_ids: vec!["jsessionid".to_string()],
            ..Default::default()
        };
        let key = CacheKey::from_request(
            &req("http://example.com/a;jsessionid=123/b;jsessionid=456"),
            &conf,
        )
        .unwrap();
        assert_eq!(key.as_str(), "http://example.com:80/a/b");

        let key =
            CacheKey::from_request(&req("http://example.com/a;jsessionid=1;v=2"), &conf).unwrap();
        assert_eq!(key.as_str(), "http://example.com:80/a;v=2");
    }

    #[test]
    fn test_method_keyable() {
        assert!(method_keyable(&Method::GET));
        assert!(method_keyable(&Method::HEAD));
        assert!(!method_keyable(&Method::POST));
        assert!(!method_keyable(&Method::PUT));
    }
}
