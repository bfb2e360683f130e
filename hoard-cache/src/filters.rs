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

//! Utility functions to help process HTTP headers for caching

use super::*;
use crate::cache_control::{CacheControl, InterpretCacheControl};
use crate::freshness::{expire_time, freshness_lifetime, initial_age, response_date};
use crate::headers::{storable_request_headers, storable_response_headers, Vary};
use crate::RespCacheable::*;

use http::header::{self, HeaderMap, HeaderName};
use http::StatusCode;

/// Decide if the request can be cacheable
pub fn request_cacheable(req_header: &ReqHeader) -> bool {
    key::method_keyable(&req_header.method)
}

// statuses that may be stored on heuristic or default freshness (RFC 9110 15.1)
fn status_heuristically_cacheable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::OK
            | StatusCode::NON_AUTHORITATIVE_INFORMATION
            | StatusCode::MULTIPLE_CHOICES
            | StatusCode::MOVED_PERMANENTLY
            | StatusCode::GONE
    )
}

/// Timing of one origin exchange
#[derive(Debug, Clone, Copy)]
pub struct Exchange {
    /// when the request was sent to the origin
    pub request_time: SystemTime,
    /// when the response headers arrived
    pub response_time: SystemTime,
}

/// Decide if the response is cacheable, and build the [CacheMeta] to store when it is.
///
/// `has_query` tells whether the cache key of the request kept a query string. `ignore` lists
/// the header names that are never stored.
pub fn resp_cacheable(
    req: &ReqHeader,
    resp: &RespHeader,
    has_query: bool,
    exchange: Exchange,
    conf: &CacheConf,
    ignore: &[HeaderName],
) -> RespCacheable {
    use NoCacheReason::*;

    if req.method == Method::HEAD {
        return Uncacheable(HeadRequest);
    }
    if matches!(
        resp.status,
        StatusCode::PARTIAL_CONTENT | StatusCode::NOT_MODIFIED
    ) {
        return Uncacheable(StatusNotCacheable);
    }

    let cache_control = CacheControl::from_resp_headers(resp);
    let cc = cache_control.as_ref();
    if cc.is_some_and(|cc| cc.no_store()) && !conf.store_no_store {
        return Uncacheable(OriginNotCache);
    }
    if cc.is_some_and(|cc| cc.private()) && !conf.store_private {
        return Uncacheable(OriginNotCache);
    }
    let req_no_store = CacheControl::from_req_headers(req).is_some_and(|cc| cc.no_store());
    if req_no_store && !conf.store_no_store {
        return Uncacheable(RequestNoStore);
    }
    // A request with Authorization is normally not cacheable, unless Cache-Control allows it
    if req.headers.contains_key(header::AUTHORIZATION)
        && !cc.is_some_and(|cc| cc.allow_caching_authorized_req())
    {
        return Uncacheable(AuthorizationRequired);
    }
    let vary = Vary::from_headers(&resp.headers);
    if vary == Vary::Any {
        return Uncacheable(VaryAny);
    }

    let Exchange {
        request_time,
        response_time,
    } = exchange;
    // the response cannot arrive before the request went out
    let response_time = response_time.max(request_time);
    let date = response_date(&resp.headers, response_time);
    let lifetime = freshness_lifetime(cc, &resp.headers, date, conf);

    if !lifetime.is_explicit() {
        if !status_heuristically_cacheable(resp.status) {
            return Uncacheable(StatusNotCacheable);
        }
        if has_query {
            return Uncacheable(QueryWithoutExpiry);
        }
        let has_validator = resp.headers.contains_key(header::LAST_MODIFIED)
            || resp.headers.contains_key(header::ETAG);
        if !has_validator && !conf.ignore_no_last_modified {
            return Uncacheable(NoValidator);
        }
    }

    let age = initial_age(
        date,
        freshness::age_value(&resp.headers),
        request_time,
        response_time,
    );
    let expire = expire_time(lifetime.duration(), age, response_time);
    if expire <= response_time && !conf.store_expired {
        return Uncacheable(AlreadyExpired);
    }

    let Some(mut resp_hdrs) = storable_response_headers(&resp.headers, ignore) else {
        return Uncacheable(MissingContentType);
    };
    if let Some(cc) = cc {
        cc.strip_private_headers(&mut resp_hdrs);
    }
    let req_hdrs = storable_request_headers(&req.headers, vary.names(), ignore);

    let info = CacheInfo {
        date,
        expire,
        request_time,
        response_time,
        status: resp.status.as_u16(),
    };
    Cacheable(CacheMeta::new(info, resp_hdrs, req_hdrs))
}

/// After a successful revalidation, update certain headers for the cached asset such as
/// `ETag` with the 304 response headers `fresh`.
///
/// The age of the result only reflects the 304: the stored `Age` is dropped, and a 304
/// without `Date` is dated `response_time`.
pub fn revalidate_merge_header(
    stored: &HeaderMap,
    fresh: &HeaderMap,
    response_time: SystemTime,
) -> HeaderMap {
    /*
     * https://datatracker.ietf.org/doc/html/rfc9110#section-15.4.5
     * 304 response MUST generate ... would have been sent in a 200 ...
     * - Content-Location, Date, ETag, and Vary
     * - Cache-Control and Expires...
     */
    const MERGED: [HeaderName; 6] = [
        header::CACHE_CONTROL,
        header::EXPIRES,
        header::ETAG,
        header::LAST_MODIFIED,
        header::DATE,
        header::CONTENT_LOCATION,
    ];
    // A changed Vary could make the stored variant answer requests it does not match, so
    // the stored one is kept.
    let mut merged = stored.clone();
    for name in MERGED {
        if !fresh.contains_key(&name) {
            continue;
        }
        merged.remove(&name);
        for value in fresh.get_all(&name) {
            merged.append(name.clone(), value.clone());
        }
    }
    merged.remove(header::AGE);
    if let Some(age) = fresh.get(header::AGE) {
        merged.insert(header::AGE, age.clone());
    }
    if !fresh.contains_key(header::DATE) {
        // RFC 9110 6.6.1: a recipient with a clock dates a response that has no Date
        let date = httpdate::fmt_http_date(response_time);
        if let Ok(date) = http::HeaderValue::from_str(&date) {
            merged.insert(header::DATE, date);
        }
    }
    merged
}

/// Filters to run when sending requests to upstream
pub mod upstream {
    use super::*;

    /// Adjust the request header for a request whose response is going to be stored
    ///
    /// - `If-*` headers are removed
    /// - `Range` header is removed
    ///
    /// When `meta` is set, this function will inject `If-Modified-Since` according to the
    /// `Last-Modified` header and inject `If-None-Match` according to `ETag` header
    pub fn request_filter(req: &mut ReqHeader, meta: Option<&CacheMeta>) {
        // remove downstream precondition headers https://datatracker.ietf.org/doc/html/rfc7232#section-3
        // we'd like to cache the 200 not the 304
        req.headers.remove(header::IF_MATCH);
        req.headers.remove(header::IF_NONE_MATCH);
        req.headers.remove(header::IF_MODIFIED_SINCE);
        req.headers.remove(header::IF_UNMODIFIED_SINCE);
        // see below range header
        req.headers.remove(header::IF_RANGE);

        // remove downstream range header as we'd like to cache the entire response
        req.headers.remove(header::RANGE);

        // we have a presumably staled response already, add precondition headers for revalidation
        if let Some(m) = meta {
            // rfc7232: "SHOULD send both validators in cache validation" but
            // there have been weird cases that an origin has matching etag but not Last-Modified
            if let Some(since) = m.response_headers().get(header::LAST_MODIFIED) {
                req.headers.insert(header::IF_MODIFIED_SINCE, since.clone());
            }
            if let Some(etag) = m.response_headers().get(header::ETAG) {
                req.headers.insert(header::IF_NONE_MATCH, etag.clone());
            }
        }
    }
}
