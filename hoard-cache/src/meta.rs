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

//! Metadata for caching

use super::*;
use crate::headers::Vary;

use hoard_error::{Error, ErrorType::*, OrErr};
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

/// The timing facts of a stored response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    /// `Date` of the response, or `response_time` when it had none
    pub date: SystemTime,
    /// when the response stops being fresh
    pub expire: SystemTime,
    /// when the request that produced the response was sent to the origin
    pub request_time: SystemTime,
    /// when the response headers arrived
    pub response_time: SystemTime,
    /// the status of the stored response
    pub status: u16,
}

impl CacheInfo {
    /// Whether the response is fresh at `now`
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        now < self.expire
    }

    /// How long the response has been stale at `now`, zero when fresh
    pub fn staleness(&self, now: SystemTime) -> Duration {
        now.duration_since(self.expire).unwrap_or_default()
    }
}

type SerializedHeaders = Vec<(String, Vec<u8>)>;

fn headers_to_vec(headers: &HeaderMap) -> SerializedHeaders {
    headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.as_bytes().to_vec()))
        .collect()
}

fn headers_from_vec(v: SerializedHeaders) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(v.len());
    for (k, v) in v {
        let name = HeaderName::from_bytes(k.as_bytes())
            .or_err(InternalError, "invalid header name in cache meta")?;
        let value =
            HeaderValue::from_bytes(&v).or_err(InternalError, "invalid header value in cache meta")?;
        headers.append(name, value);
    }
    Ok(headers)
}

mod internal_meta {
    use super::*;

    pub(crate) type InternalMetaLatest = InternalMetaV1;

    #[derive(Debug, Deserialize, Serialize, Clone)]
    pub(crate) struct InternalMetaV1 {
        pub(crate) version: u8,
        pub(crate) info: CacheInfo,
        pub(crate) resp_hdrs: SerializedHeaders,
        pub(crate) req_hdrs: SerializedHeaders,
        // Only the extended fields to be added below, with serde default
    }

    impl InternalMetaV1 {
        pub const VERSION: u8 = 1;

        pub fn serialize(&self) -> Result<Vec<u8>> {
            rmp_serde::encode::to_vec(self).or_err(InternalError, "failed to encode cache meta")
        }

        fn deserialize(buf: &[u8]) -> Result<Self> {
            rmp_serde::decode::from_slice(buf)
                .or_err(InternalError, "failed to decode cache meta v1")
        }
    }

    pub(crate) fn deserialize(buf: &[u8]) -> Result<InternalMetaLatest> {
        const MIN_SIZE: usize = 2; // array marker and version
        if buf.len() < MIN_SIZE {
            return Error::e_explain(
                InternalError,
                format!("Buf too short ({}) to be InternalMeta", buf.len()),
            );
        }
        let preread_buf = &mut &buf[..MIN_SIZE];
        // the struct is always packed as an array with the version first
        rmp::decode::read_array_len(preread_buf)
            .or_err(InternalError, "failed to decode cache meta array size")?;
        // rmp encodes `version` < 128 into a fixint (one byte)
        let version = rmp::decode::read_pfix(preread_buf)
            .or_err(InternalError, "failed to decode meta version")?;
        match version {
            1 => InternalMetaV1::deserialize(buf),
            _ => Error::e_explain(
                InternalError,
                format!("Unknown InternalMeta version {version}"),
            ),
        }
    }
}

/// What a provider keeps for an entity besides its body
///
/// The stored response status and headers, the request headers that selected it and the
/// [CacheInfo].
#[derive(Debug, Clone)]
pub struct CacheMeta {
    info: CacheInfo,
    resp_hdrs: HeaderMap,
    req_hdrs: HeaderMap,
}

impl CacheMeta {
    pub fn new(info: CacheInfo, resp_hdrs: HeaderMap, req_hdrs: HeaderMap) -> Self {
        CacheMeta {
            info,
            resp_hdrs,
            req_hdrs,
        }
    }

    pub fn info(&self) -> &CacheInfo {
        &self.info
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.info.status).unwrap_or(StatusCode::OK)
    }

    /// The stored response headers
    pub fn response_headers(&self) -> &HeaderMap {
        &self.resp_hdrs
    }

    /// The stored request headers
    pub fn request_headers(&self) -> &HeaderMap {
        &self.req_hdrs
    }

    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.info.is_fresh(now)
    }

    /// The `Age` the origin (or an upstream cache) reported
    pub fn age_value(&self) -> Duration {
        freshness::age_value(&self.resp_hdrs)
    }

    /// Age of the stored response at `now`
    pub fn current_age(&self, now: SystemTime) -> Duration {
        freshness::current_age(&self.info, self.age_value(), now)
    }

    pub fn vary(&self) -> Vary {
        Vary::from_headers(&self.resp_hdrs)
    }

    /// Build the header to serve, with `Age` set to the current age.
    pub fn response_header(&self, now: SystemTime) -> RespHeader {
        let (mut resp, _) = http::Response::new(()).into_parts();
        resp.status = self.status();
        resp.headers = self.resp_hdrs.clone();
        resp.headers
            .insert(header::AGE, HeaderValue::from(self.current_age(now).as_secs()));
        resp
    }

    /// Take the timing and headers of a revalidation while keeping the stored body and the
    /// original status.
    ///
    /// The age of the entity restarts from the revalidation exchange.
    pub fn refresh(&mut self, fresh: &CacheMeta) {
        self.info.date = fresh.info.date;
        self.info.expire = fresh.info.expire;
        self.info.request_time = fresh.info.request_time;
        self.info.response_time = fresh.info.response_time;
        self.resp_hdrs = fresh.resp_hdrs.clone();
    }

    /// Serialize this object
    pub fn serialize(&self) -> Result<Vec<u8>> {
        internal_meta::InternalMetaLatest {
            version: internal_meta::InternalMetaLatest::VERSION,
            info: self.info,
            resp_hdrs: headers_to_vec(&self.resp_hdrs),
            req_hdrs: headers_to_vec(&self.req_hdrs),
        }
        .serialize()
    }

    /// Deserialize from the binary format
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let internal = internal_meta::deserialize(buf)?;
        Ok(CacheMeta {
            info: internal.info,
            resp_hdrs: headers_from_vec(internal.resp_hdrs)?,
            req_hdrs: headers_from_vec(internal.req_hdrs)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(now: SystemTime, fresh: u64) -> CacheInfo {
        CacheInfo {
            date: now,
            expire: now + Duration::from_secs(fresh),
            request_time: now,
            response_time: now,
            status: 200,
        }
    }

    fn meta(now: SystemTime) -> CacheMeta {
        let mut resp_hdrs = HeaderMap::new();
        resp_hdrs.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        resp_hdrs.append("x-multi", HeaderValue::from_static("a"));
        resp_hdrs.append("x-multi", HeaderValue::from_static("b"));
        let mut req_hdrs = HeaderMap::new();
        req_hdrs.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        CacheMeta::new(info(now, 10), resp_hdrs, req_hdrs)
    }

    #[test]
    fn test_serde() {
        let now = SystemTime::now();
        let meta = meta(now);
        let binary = meta.serialize().unwrap();
        let meta2 = CacheMeta::deserialize(&binary).unwrap();
        assert_eq!(meta2.info(), meta.info());
        assert_eq!(meta2.response_headers(), meta.response_headers());
        assert_eq!(meta2.request_headers(), meta.request_headers());
        let multi: Vec<_> = meta2.response_headers().get_all("x-multi").iter().collect();
        assert_eq!(multi, vec!["a", "b"]);
    }

    #[test]
    fn test_deserialize_garbage() {
        assert!(CacheMeta::deserialize(b"").is_err());
        assert!(CacheMeta::deserialize(b"\x94\x07garbage").is_err());
    }

    #[test]
    fn test_fresh() {
        let now = SystemTime::now();
        let meta = meta(now);
        assert!(meta.is_fresh(now));
        assert!(meta.is_fresh(now + Duration::from_secs(9)));
        assert!(!meta.is_fresh(now + Duration::from_secs(10)));
        assert_eq!(
            meta.info().staleness(now + Duration::from_secs(15)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_response_header_age() {
        let now = SystemTime::now();
        let meta = meta(now);
        let resp = meta.response_header(now + Duration::from_secs(3));
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.headers[header::AGE], "3");
        assert_eq!(resp.headers[header::CONTENT_TYPE], "text/plain");
        // stored headers are untouched
        assert!(!meta.response_headers().contains_key(header::AGE));
    }

    #[test]
    fn test_refresh() {
        let now = SystemTime::now();
        let mut stored = meta(now);
        let later = now + Duration::from_secs(100);
        let mut fresh_hdrs = stored.response_headers().clone();
        fresh_hdrs.insert(header::ETAG, HeaderValue::from_static("\"v2\""));
        let mut fresh_info = info(later, 60);
        fresh_info.request_time = later;
        fresh_info.status = 304;
        let fresh = CacheMeta::new(fresh_info, fresh_hdrs, HeaderMap::new());

        stored.refresh(&fresh);
        assert_eq!(stored.info().date, later);
        assert_eq!(stored.info().response_time, later);
        assert_eq!(stored.info().expire, later + Duration::from_secs(60));
        assert_eq!(stored.info().request_time, later);
        // no residual delay from the first exchange
        assert_eq!(stored.current_age(later), Duration::ZERO);
        // status and request headers are kept
        assert_eq!(stored.status(), StatusCode::OK);
        assert!(stored.request_headers().contains_key(header::ACCEPT_ENCODING));
        assert_eq!(stored.response_headers()[header::ETAG], "\"v2\"");
    }
}
