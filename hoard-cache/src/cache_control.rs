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

//! Parsing and interpretation of Cache-Control and Pragma headers

use super::*;

use http::header::HeaderName;
use http::{HeaderMap, HeaderValue};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use hoard_error::{Error, ErrorType};
use regex::bytes::Regex;
use std::num::IntErrorKind;
use std::slice;
use std::str;

/// The max delta-second per [RFC 9111](https://datatracker.ietf.org/doc/html/rfc9111#section-1.2.2)
// "If a cache receives a delta-seconds
// value greater than the greatest integer it can represent, or if any
// of its subsequent calculations overflows, the cache MUST consider the
// value to be either 2147483648 (2^31) or the greatest positive integer
// it can conveniently represent."
pub const DELTA_SECONDS_OVERFLOW_VALUE: u32 = 2147483648;

/// Cache control directive key type
pub type DirectiveKey = String;

/// Cache control directive value type
#[derive(Debug)]
pub struct DirectiveValue(pub Vec<u8>);

impl AsRef<[u8]> for DirectiveValue {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl DirectiveValue {
    /// A [DirectiveValue] without quotes (`"`).
    pub fn parse_as_bytes(&self) -> &[u8] {
        self.0
            .strip_prefix(&[b'"'])
            .and_then(|bytes| bytes.strip_suffix(&[b'"']))
            .unwrap_or(&self.0[..])
    }

    /// A [DirectiveValue] without quotes (`"`) as `str`.
    pub fn parse_as_str(&self) -> Result<&str> {
        str::from_utf8(self.parse_as_bytes()).or_else(|e| {
            Error::e_because(ErrorType::InvalidHeader, "could not parse value as utf8", e)
        })
    }

    /// Parse the [DirectiveValue] as delta seconds
    ///
    /// `"`s are ignored. The value is capped to [DELTA_SECONDS_OVERFLOW_VALUE].
    pub fn parse_as_delta_seconds(&self) -> Result<u32> {
        match self.parse_as_str()?.parse::<u32>() {
            Ok(value) => Ok(value),
            Err(e) => {
                // delta-seconds expect to handle positive overflow gracefully
                if e.kind() == &IntErrorKind::PosOverflow {
                    Ok(DELTA_SECONDS_OVERFLOW_VALUE)
                } else {
                    Error::e_because(ErrorType::InvalidHeader, "could not parse value as u32", e)
                }
            }
        }
    }
}

/// An ordered map to store cache control key value pairs.
pub type DirectiveMap = IndexMap<DirectiveKey, Option<DirectiveValue>>;

/// Parsed Cache-Control directives
#[derive(Debug)]
pub struct CacheControl {
    /// The parsed directives
    pub directives: DirectiveMap,
}

/// An iter over all the cache control directives
pub struct ListValueIter<'a>(slice::Split<'a, u8, fn(&u8) -> bool>);

impl<'a> ListValueIter<'a> {
    pub fn from(value: &'a DirectiveValue) -> Self {
        ListValueIter(value.parse_as_bytes().split(|byte| byte == &b','))
    }
}

// https://datatracker.ietf.org/doc/html/rfc9110#name-whitespace
// optional whitespace OWS = *(SP / HTAB); SP = 0x20, HTAB = 0x09
fn trim_ows(bytes: &[u8]) -> &[u8] {
    fn not_ows(b: &u8) -> bool {
        b != &b'\x20' && b != &b'\x09'
    }
    let head = bytes.iter().position(not_ows).unwrap_or(0);
    let tail = bytes
        .iter()
        .rposition(not_ows)
        .map(|rpos| rpos + 1)
        .unwrap_or(head);
    &bytes[head..tail]
}

impl<'a> Iterator for ListValueIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        Some(trim_ows(self.0.next()?))
    }
}

// cache-directive = token [ "=" ( token / quoted-string ) ]
// token           = [^\x00-\x20\(\)<>@\,;\:\\"\/\[\]\?\=\{\}\x7F]+
// quoted-string   = "(?:[^"\\]|\\.)*"
//
// `(?-u)` puts the regex in ASCII compatible mode so literal bytes like \x7F can be matched,
// both `,` and `;` are accepted as delimiters, obs-text (%x80-FF) is not rejected.
static RE_CACHE_DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?-u)(?:^|(?:\s*[,;]\s*))([^\x00-\x20\(\)<>@,;:\\"/\[\]\?=\{\}\x7F]+)(?:=((?:[^\x00-\x20\(\)<>@,;:\\"/\[\]\?=\{\}\x7F]+|(?:"(?:[^"\\]|\\.)*"))))?"#)
        .unwrap()
});

impl CacheControl {
    fn from_lines(lines: http::header::GetAll<HeaderValue>) -> Self {
        let mut directives = IndexMap::new();
        for line in lines {
            for captures in RE_CACHE_DIRECTIVE.captures_iter(line.as_bytes()) {
                // keys are stored lowercase for case-insensitive lookup, values keep their bytes
                let Some(key) = captures.get(1).and_then(|cap| {
                    str::from_utf8(cap.as_bytes())
                        .ok()
                        .map(|token| token.to_lowercase())
                }) else {
                    continue;
                };
                let value = captures
                    .get(2)
                    .map(|cap| DirectiveValue(cap.as_bytes().to_vec()));
                directives.insert(key, value);
            }
        }
        CacheControl { directives }
    }

    /// Parse from the given header name in `headers`
    ///
    /// `None` if the header is absent.
    pub fn from_headers_named(header_name: &str, headers: &HeaderMap) -> Option<Self> {
        if !headers.contains_key(header_name) {
            return None;
        }
        Some(Self::from_lines(headers.get_all(header_name)))
    }

    /// Parse `Cache-Control` from `headers`
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        Self::from_headers_named("cache-control", headers)
    }

    /// Parse `Cache-Control` from the [ReqHeader]
    pub fn from_req_headers(req_header: &ReqHeader) -> Option<Self> {
        Self::from_headers(&req_header.headers)
    }

    /// Parse `Cache-Control` from the [RespHeader]
    pub fn from_resp_headers(resp_header: &RespHeader) -> Option<Self> {
        Self::from_headers(&resp_header.headers)
    }

    /// Whether the given directive is in the cache control.
    pub fn has_key(&self, key: &str) -> bool {
        self.directives.contains_key(key)
    }

    /// Whether the `public` directive is in the cache control.
    pub fn public(&self) -> bool {
        self.has_key("public")
    }

    fn has_key_without_value(&self, key: &str) -> bool {
        matches!(self.directives.get(key), Some(None))
    }

    /// Whether the standalone `private` exists in the cache control
    // RFC 9111 5.2.2.7: the field-name form of `private` only forbids storing the listed
    // fields, the boolean form applies to the whole response.
    pub fn private(&self) -> bool {
        self.has_key_without_value("private")
    }

    fn get_field_names(&self, key: &str) -> Option<ListValueIter> {
        if let Some(Some(value)) = self.directives.get(key) {
            Some(ListValueIter::from(value))
        } else {
            None
        }
    }

    /// Get the values of `private=`
    pub fn private_field_names(&self) -> Option<ListValueIter> {
        self.get_field_names("private")
    }

    /// Whether the standalone `no-cache` exists in the cache control
    pub fn no_cache(&self) -> bool {
        self.has_key_without_value("no-cache")
    }

    /// Get the values of `no-cache=`
    pub fn no_cache_field_names(&self) -> Option<ListValueIter> {
        self.get_field_names("no-cache")
    }

    /// Whether `no-store` exists.
    pub fn no_store(&self) -> bool {
        self.has_key("no-store")
    }

    fn parse_delta_seconds(&self, key: &str) -> Result<Option<u32>> {
        if let Some(Some(dir_value)) = self.directives.get(key) {
            Ok(Some(dir_value.parse_as_delta_seconds()?))
        } else {
            Ok(None)
        }
    }

    /// Return the `max-age` seconds
    pub fn max_age(&self) -> Result<Option<u32>> {
        self.parse_delta_seconds("max-age")
    }

    /// Return the `s-maxage` seconds
    pub fn s_maxage(&self) -> Result<Option<u32>> {
        self.parse_delta_seconds("s-maxage")
    }

    /// Return the `min-fresh` seconds of a request
    pub fn min_fresh(&self) -> Result<Option<u32>> {
        self.parse_delta_seconds("min-fresh")
    }

    /// The staleness a client accepts through `max-stale`
    ///
    /// - `None`: no `max-stale`
    /// - `Some(None)`: `max-stale` without a value, any staleness is accepted
    /// - `Some(Some(s))`: at most `s` seconds of staleness
    pub fn max_stale(&self) -> Option<Option<u32>> {
        match self.directives.get("max-stale")? {
            None => Some(None),
            // an unparsable value is read as "any"
            Some(v) => Some(v.parse_as_delta_seconds().ok()),
        }
    }

    /// Whether `must-revalidate` exists.
    pub fn must_revalidate(&self) -> bool {
        self.has_key("must-revalidate")
    }

    /// Whether `proxy-revalidate` exists.
    pub fn proxy_revalidate(&self) -> bool {
        self.has_key("proxy-revalidate")
    }

    /// Whether `only-if-cached` exists.
    pub fn only_if_cached(&self) -> bool {
        self.has_key("only-if-cached")
    }
}

/// Whether the request carries `Pragma: no-cache`
///
/// Only consulted when the request has no Cache-Control.
pub fn pragma_no_cache(headers: &HeaderMap) -> bool {
    CacheControl::from_headers_named("pragma", headers).is_some_and(|p| p.has_key("no-cache"))
}

impl InterpretCacheControl for CacheControl {
    fn allow_caching_authorized_req(&self) -> bool {
        // RFC 9111 3.5: a shared cache MUST NOT reuse a response to a request with
        // Authorization unless one of these is present
        self.must_revalidate() || self.public() || self.has_key("s-maxage")
    }

    fn fresh_sec(&self) -> Option<u32> {
        if self.no_cache() {
            // always treated as stale
            return Some(0);
        }
        match self.s_maxage() {
            Ok(Some(seconds)) => Some(seconds),
            Ok(None) => match self.max_age() {
                Ok(Some(seconds)) => Some(seconds),
                _ => None,
            },
            _ => None,
        }
    }

    fn forbids_stale(&self) -> bool {
        self.must_revalidate() || self.proxy_revalidate() || self.has_key("s-maxage")
    }

    fn strip_private_headers(&self, headers: &mut HeaderMap) {
        fn strip_listed_headers(headers: &mut HeaderMap, field_names: ListValueIter) {
            for name in field_names {
                if let Ok(name) = HeaderName::from_bytes(name) {
                    headers.remove(&name);
                }
            }
        }

        if let Some(names) = self.private_field_names() {
            strip_listed_headers(headers, names);
        }
        // `no-cache=` fields are treated like `private=` ones
        if let Some(names) = self.no_cache_field_names() {
            strip_listed_headers(headers, names);
        }
    }
}

/// `InterpretCacheControl` reads the parsed [CacheControl] as a shared cache would.
pub trait InterpretCacheControl {
    /// Does this cache-control allow caching a response to
    /// a request with the Authorization header?
    fn allow_caching_authorized_req(&self) -> bool;

    /// Returns freshness ttl specified in cache-control
    ///
    /// - `Some(_)` indicates cache-control specifies a valid ttl. Some(0) = always stale.
    /// - `None` means cache-control did not specify a valid ttl.
    fn fresh_sec(&self) -> Option<u32>;

    /// Whether a stale copy must not be served even if the client allows it via `max-stale`
    fn forbids_stale(&self) -> bool;

    /// Strip header names listed in `private` or `no-cache` directives,
    /// usually prior to storing a response.
    fn strip_private_headers(&self, headers: &mut HeaderMap);
}
