// Copyright 2024 Cloudflare, Inc.
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

//! Cache configuration

use hoard_error::{Error, ErrorType::*, OrErr, Result};
use http::header::HeaderName;
use http::Uri;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Attach a storage provider to a URL prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEnable {
    /// The name the provider was registered under
    pub provider: String,
    /// A path prefix (`/static`) or an absolute URL prefix (`http://example.com/static`)
    pub url: String,
}

/// The effective cache configuration for a scope
///
/// Every field has a default so partial YAML documents load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConf {
    /// URL prefixes to cache and the provider to use for each
    pub enable: Vec<CacheEnable>,
    /// URL prefixes never cached. Wins over `enable`.
    pub disable: Vec<String>,
    /// Upper bound of any computed freshness lifetime
    pub max_expire_secs: u64,
    /// Lower bound of any computed freshness lifetime
    pub min_expire_secs: u64,
    /// Lifetime used when the response gives no other hint
    pub default_expire_secs: u64,
    /// Fraction of `Date - Last-Modified` used as heuristic lifetime
    pub last_modified_factor: f64,
    /// Cache responses that carry neither a validator nor an explicit expiry
    pub ignore_no_last_modified: bool,
    /// Disregard client Cache-Control / Pragma on requests
    pub ignore_cache_control: bool,
    /// Store responses that are already stale on arrival
    pub store_expired: bool,
    /// Store responses marked `private`
    pub store_private: bool,
    /// Store responses marked `no-store`
    pub store_no_store: bool,
    /// Header names never stored
    pub ignore_headers: Vec<String>,
    /// Drop the query string from cache keys
    pub ignore_query_string: bool,
    /// Query and path parameter names removed from cache keys
    pub ignore_session_ids: Vec<String>,
    /// Allow only one populator per key at a time
    pub lock: bool,
    /// Age after which a held lock is considered abandoned
    pub lock_max_age_secs: u64,
    /// Serve hits before any further request processing
    pub quick_handler: bool,
    /// Body bytes buffered while the store decision is pending
    pub max_buffer_bytes: usize,
    /// Responses larger than this are never stored
    pub max_file_size_bytes: Option<usize>,
}

impl Default for CacheConf {
    fn default() -> Self {
        CacheConf {
            enable: vec![],
            disable: vec![],
            max_expire_secs: 86400,
            min_expire_secs: 0,
            default_expire_secs: 3600,
            last_modified_factor: 0.1,
            ignore_no_last_modified: false,
            ignore_cache_control: false,
            store_expired: false,
            store_private: false,
            store_no_store: false,
            ignore_headers: vec![],
            ignore_query_string: false,
            ignore_session_ids: vec![],
            lock: true,
            lock_max_age_secs: 5,
            quick_handler: true,
            max_buffer_bytes: 65536,
            max_file_size_bytes: None,
        }
    }
}

impl CacheConf {
    // Does not have to be async until we want runtime reload
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ConfigurationError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: CacheConf = serde_yaml::from_str(conf_str).or_err_with(ConfigurationError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;
        trace!("Loaded conf: {conf:?}");
        conf.validate()
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    /// Check every field and return the conf back if it is usable.
    pub fn validate(self) -> Result<Self> {
        if self.min_expire_secs > self.max_expire_secs {
            return Error::e_config(format!(
                "min_expire_secs {} is larger than max_expire_secs {}",
                self.min_expire_secs, self.max_expire_secs
            ));
        }
        if !self.last_modified_factor.is_finite() || self.last_modified_factor < 0.0 {
            return Error::e_config(format!(
                "invalid last_modified_factor {}",
                self.last_modified_factor
            ));
        }
        if self.lock && self.lock_max_age_secs == 0 {
            return Error::e_config("lock_max_age_secs must be positive when lock is on");
        }
        if self.max_buffer_bytes == 0 {
            return Error::e_config("max_buffer_bytes must be positive");
        }
        for enable in self.enable.iter() {
            if enable.provider.is_empty() {
                return Error::e_config(format!("empty provider name for {}", enable.url));
            }
            UrlPattern::parse(&enable.url)?;
        }
        for url in self.disable.iter() {
            UrlPattern::parse(url)?;
        }
        self.ignore_header_names()?;
        for id in self.ignore_session_ids.iter() {
            let invalid = |c: char| "=&;/?#".contains(c) || c.is_whitespace();
            if id.is_empty() || id.contains(invalid) {
                return Error::e_config(format!("invalid session identifier {id:?}"));
            }
        }
        Ok(self)
    }

    /// The configured ignore list as header names
    pub fn ignore_header_names(&self) -> Result<Vec<HeaderName>> {
        self.ignore_headers
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes()).or_err_with(ConfigurationError, || {
                    format!("invalid header name {name:?} in ignore_headers")
                })
            })
            .collect()
    }

    pub fn max_expire(&self) -> Duration {
        Duration::from_secs(self.max_expire_secs)
    }

    pub fn min_expire(&self) -> Duration {
        Duration::from_secs(self.min_expire_secs)
    }

    pub fn default_expire(&self) -> Duration {
        Duration::from_secs(self.default_expire_secs)
    }

    pub fn lock_max_age(&self) -> Duration {
        Duration::from_secs(self.lock_max_age_secs)
    }

    /// Bound a freshness lifetime to `[min_expire, max_expire]`.
    pub fn clamp_lifetime(&self, lifetime: Duration) -> Duration {
        lifetime.clamp(self.min_expire(), self.max_expire())
    }
}

/// A parsed `enable`/`disable` URL
///
/// A pattern with only a path matches any scheme and host. A pattern with a scheme and host
/// must match both, case-insensitively. Paths match on a `/` boundary: `/static` matches
/// `/static` and `/static/a.css` but not `/statics`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    scheme: Option<String>,
    host: Option<String>,
    path: String,
}

impl UrlPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.starts_with('/') {
            if pattern.contains(|c: char| c == '?' || c == '#' || c.is_whitespace()) {
                return Error::e_config(format!("invalid path pattern {pattern:?}"));
            }
            return Ok(UrlPattern {
                scheme: None,
                host: None,
                path: pattern.to_string(),
            });
        }
        let uri: Uri = pattern
            .parse()
            .or_err_with(ConfigurationError, || format!("invalid url pattern {pattern:?}"))?;
        let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) else {
            return Error::e_config(format!(
                "url pattern {pattern:?} must be a path or an absolute url"
            ));
        };
        if uri.query().is_some() {
            return Error::e_config(format!("url pattern {pattern:?} has a query"));
        }
        let path = match uri.path() {
            "" => "/",
            p => p,
        };
        Ok(UrlPattern {
            scheme: Some(scheme.to_ascii_lowercase()),
            host: Some(authority.host().to_ascii_lowercase()),
            path: path.to_string(),
        })
    }

    pub fn matches(&self, scheme: &str, host: &str, path: &str) -> bool {
        if let Some(s) = self.scheme.as_ref() {
            if !s.eq_ignore_ascii_case(scheme) {
                return false;
            }
        }
        if let Some(h) = self.host.as_ref() {
            if !h.eq_ignore_ascii_case(host) {
                return false;
            }
        }
        path_matches(&self.path, path)
    }
}

fn path_matches(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    prefix.ends_with('/') || path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'/'
}
