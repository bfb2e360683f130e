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

//! Age and freshness lifetime calculations (RFC 9111 section 4.2)

use super::*;
use crate::cache_control::{pragma_no_cache, CacheControl, InterpretCacheControl};

use http::{header, HeaderMap, HeaderValue};
use httpdate::HttpDate;
use log::warn;

/// Parse an HTTP-date header value
pub fn parse_http_date(value: &HeaderValue) -> Option<SystemTime> {
    let value = value.to_str().ok()?;
    value.parse::<HttpDate>().ok().map(SystemTime::from)
}

/// The `Date` of the response, `fallback` if absent or invalid
pub fn response_date(headers: &HeaderMap, fallback: SystemTime) -> SystemTime {
    headers
        .get(header::DATE)
        .and_then(parse_http_date)
        .unwrap_or(fallback)
}

/// The `Age` of the response, zero if absent or invalid
pub fn age_value(headers: &HeaderMap) -> Duration {
    headers
        .get(header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(Duration::ZERO, Duration::from_secs)
}

/// The age of a response when it arrived
///
/// `corrected_age + (response_time - request_time)` where `corrected_age` is the larger of the
/// apparent age (`response_time - date`) and the `Age` header.
pub fn initial_age(
    date: SystemTime,
    age_value: Duration,
    request_time: SystemTime,
    response_time: SystemTime,
) -> Duration {
    let apparent_age = response_time.duration_since(date).unwrap_or_default();
    let corrected_age = apparent_age.max(age_value);
    let response_delay = response_time
        .duration_since(request_time)
        .unwrap_or_default();
    corrected_age + response_delay
}

/// The age of a stored response at `now`: its initial age plus the time it has been resident
pub fn current_age(info: &CacheInfo, age_value: Duration, now: SystemTime) -> Duration {
    let resident_time = now.duration_since(info.response_time).unwrap_or_default();
    initial_age(info.date, age_value, info.request_time, info.response_time) + resident_time
}

/// A freshness lifetime and where it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// From `s-maxage`, `max-age` or `Expires`
    Explicit(Duration),
    /// A fraction of the time since `Last-Modified`
    Heuristic(Duration),
    /// Nothing to go by
    Default(Duration),
}

impl Lifetime {
    pub fn duration(&self) -> Duration {
        match self {
            Lifetime::Explicit(d) | Lifetime::Heuristic(d) | Lifetime::Default(d) => *d,
        }
    }

    pub fn is_explicit(&self) -> bool {
        matches!(self, Lifetime::Explicit(_))
    }
}

/// Calculate the expire time from the `Expires` header only
///
/// Multiple `Expires` are ignored, an invalid one is a time in the past.
pub fn calculate_expires_header_time(headers: &HeaderMap) -> Option<SystemTime> {
    let mut expires_iter = headers.get_all(header::EXPIRES).iter();
    let expires = expires_iter.next()?;
    if expires_iter.next().is_some() {
        return None;
    }
    match parse_http_date(expires) {
        Some(t) => Some(t),
        None => {
            warn!("Invalid HttpDate in Expires: {:?}", expires);
            Some(SystemTime::UNIX_EPOCH)
        }
    }
}

/// Compute the freshness lifetime of a response, bounded by the configured min and max.
///
/// `s-maxage` wins over `max-age`, which wins over `Expires`. Without any of those the
/// `Last-Modified` heuristic applies, and without that the default lifetime.
pub fn freshness_lifetime(
    cache_control: Option<&CacheControl>,
    headers: &HeaderMap,
    date: SystemTime,
    conf: &CacheConf,
) -> Lifetime {
    if let Some(secs) = cache_control.and_then(|cc| cc.fresh_sec()) {
        let lifetime = Duration::from_secs(secs.into());
        return Lifetime::Explicit(conf.clamp_lifetime(lifetime));
    }
    if let Some(expires) = calculate_expires_header_time(headers) {
        let lifetime = expires.duration_since(date).unwrap_or_default();
        return Lifetime::Explicit(conf.clamp_lifetime(lifetime));
    }
    let last_modified = headers
        .get(header::LAST_MODIFIED)
        .and_then(parse_http_date);
    if let Some(lm) = last_modified {
        if let Ok(since) = date.duration_since(lm) {
            if !since.is_zero() {
                let lifetime = since.mul_f64(conf.last_modified_factor);
                return Lifetime::Heuristic(conf.clamp_lifetime(lifetime));
            }
        }
    }
    Lifetime::Default(conf.clamp_lifetime(conf.default_expire()))
}

/// The absolute time a response with `lifetime` and `initial_age` stops being fresh.
///
/// `now < expire_time(..)` is the same as `current_age(now) < lifetime`.
pub fn expire_time(
    lifetime: Duration,
    initial_age: Duration,
    response_time: SystemTime,
) -> SystemTime {
    response_time
        .checked_add(lifetime)
        .and_then(|t| t.checked_sub(initial_age))
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Whether the client allows a stored response to be served without asking the origin.
///
/// `Cache-Control: no-cache`, `Cache-Control: max-age=0` and (without Cache-Control)
/// `Pragma: no-cache` all deny it, unless `ignore_cache_control` is set.
pub fn check_allowed(req: &ReqHeader, conf: &CacheConf) -> bool {
    if conf.ignore_cache_control {
        return true;
    }
    match CacheControl::from_req_headers(req) {
        Some(cc) => !(cc.has_key("no-cache") || matches!(cc.max_age(), Ok(Some(0)))),
        None => !pragma_no_cache(&req.headers),
    }
}

/// Whether `meta` can answer the request at `now`, honoring the `max-age`, `min-fresh` and
/// `max-stale` of the request.
pub fn fresh_for_request(
    meta: &CacheMeta,
    req_cache_control: Option<&CacheControl>,
    now: SystemTime,
) -> bool {
    let fresh = meta.is_fresh(now);
    let Some(cc) = req_cache_control else {
        return fresh;
    };

    if let Ok(Some(max_age)) = cc.max_age() {
        if meta.current_age(now) > Duration::from_secs(max_age.into()) {
            return false;
        }
    }
    if let Ok(Some(min_fresh)) = cc.min_fresh() {
        let needed = now + Duration::from_secs(min_fresh.into());
        if needed >= meta.info().expire {
            return false;
        }
    }
    if fresh {
        return true;
    }

    let Some(max_stale) = cc.max_stale() else {
        return false;
    };
    let forbids_stale = CacheControl::from_headers(meta.response_headers())
        .is_some_and(|stored| stored.forbids_stale());
    if forbids_stale {
        return false;
    }
    match max_stale {
        None => true,
        Some(secs) => meta.info().staleness(now) <= Duration::from_secs(secs.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpdate::fmt_http_date;

    fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.append(*k, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    fn epoch_plus(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_initial_age() {
        let date = epoch_plus(1_000_000);
        // apparent age 5s, no Age header, 1s response delay
        let age = initial_age(date, Duration::ZERO, date + Duration::from_secs(4), date + Duration::from_secs(5));
        assert_eq!(age, Duration::from_secs(6));
        // Age header wins when larger
        let age = initial_age(date, Duration::from_secs(30), date, date);
        assert_eq!(age, Duration::from_secs(30));
        // a Date in the future does not make the age negative
        let age = initial_age(date + Duration::from_secs(100), Duration::ZERO, date, date);
        assert_eq!(age, Duration::ZERO);
    }

    #[test]
    fn test_current_age_monotonic() {
        let t = epoch_plus(1_000_000);
        let info = CacheInfo {
            date: t,
            expire: t + Duration::from_secs(60),
            request_time: t,
            response_time: t,
            status: 200,
        };
        let mut last = Duration::ZERO;
        for i in 0..100 {
            let age = current_age(&info, Duration::from_secs(2), t + Duration::from_secs(i));
            assert!(age >= last);
            last = age;
        }
        assert_eq!(current_age(&info, Duration::ZERO, t + Duration::from_secs(7)).as_secs(), 7);
        // before the response arrived
        assert_eq!(current_age(&info, Duration::ZERO, t - Duration::from_secs(7)).as_secs(), 0);
    }

    #[test]
    fn test_lifetime_precedence() {
        let conf = CacheConf::default();
        let date = epoch_plus(1_000_000);
        let expires = fmt_http_date(date + Duration::from_secs(500));

        let h = headers(&[
            ("cache-control", "max-age=100, s-maxage=50".to_string()),
            ("expires", expires.clone()),
        ]);
        let cc = CacheControl::from_headers(&h);
        let lifetime = freshness_lifetime(cc.as_ref(), &h, date, &conf);
        assert_eq!(lifetime, Lifetime::Explicit(Duration::from_secs(50)));

        let h = headers(&[("cache-control", "max-age=100".to_string()), ("expires", expires.clone())]);
        let cc = CacheControl::from_headers(&h);
        let lifetime = freshness_lifetime(cc.as_ref(), &h, date, &conf);
        assert_eq!(lifetime, Lifetime::Explicit(Duration::from_secs(100)));

        let h = headers(&[("expires", expires)]);
        let lifetime = freshness_lifetime(None, &h, date, &conf);
        assert_eq!(lifetime, Lifetime::Explicit(Duration::from_secs(500)));
    }

    #[test]
    fn test_lifetime_clamped() {
        let conf = CacheConf {
            min_expire_secs: 10,
            max_expire_secs: 100,
            ..Default::default()
        };
        let date = epoch_plus(1_000_000);
        let h = headers(&[("cache-control", "max-age=100000".to_string())]);
        let cc = CacheControl::from_headers(&h);
        assert_eq!(
            freshness_lifetime(cc.as_ref(), &h, date, &conf).duration(),
            Duration::from_secs(100)
        );
        let h = headers(&[("cache-control", "max-age=1".to_string())]);
        let cc = CacheControl::from_headers(&h);
        assert_eq!(
            freshness_lifetime(cc.as_ref(), &h, date, &conf).duration(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_heuristic() {
        let conf = CacheConf::default();
        let date = epoch_plus(1_000_000);
        let lm = fmt_http_date(date - Duration::from_secs(10_000));
        let h = headers(&[("last-modified", lm)]);
        let lifetime = freshness_lifetime(None, &h, date, &conf);
        // 10% of the time since last modification
        assert!(matches!(lifetime, Lifetime::Heuristic(_)));
        assert_eq!(lifetime.duration().as_secs(), 1000);
        assert!(!lifetime.is_explicit());

        // Last-Modified after Date falls to the default
        let lm = fmt_http_date(date + Duration::from_secs(10));
        let h = headers(&[("last-modified", lm)]);
        let lifetime = freshness_lifetime(None, &h, date, &conf);
        assert_eq!(lifetime, Lifetime::Default(Duration::from_secs(3600)));
    }

    #[test]
    fn test_invalid_expires() {
        let conf = CacheConf::default();
        let date = epoch_plus(1_000_000);
        let h = headers(&[("expires", "0".to_string())]);
        assert_eq!(
            freshness_lifetime(None, &h, date, &conf),
            Lifetime::Explicit(Duration::ZERO)
        );
    }

    #[test]
    fn test_expire_time() {
        let t = epoch_plus(1_000_000);
        let expire = expire_time(Duration::from_secs(60), Duration::from_secs(10), t);
        assert_eq!(expire, t + Duration::from_secs(50));
        let expire = expire_time(Duration::ZERO, Duration::ZERO, t);
        assert_eq!(expire, t);
    }

    fn request(pairs: &[(&'static str, &str)]) -> ReqHeader {
        let mut builder = http::Request::builder().uri("http://example.com/");
        for (k, v) in pairs {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_check_allowed() {
        let conf = CacheConf::default();
        assert!(check_allowed(&request(&[]), &conf));
        assert!(!check_allowed(&request(&[("cache-control", "no-cache")]), &conf));
        assert!(!check_allowed(&request(&[("cache-control", "max-age=0")]), &conf));
        assert!(check_allowed(&request(&[("cache-control", "max-age=10")]), &conf));
        assert!(!check_allowed(&request(&[("pragma", "no-cache")]), &conf));
        // Cache-Control takes precedence over Pragma
        assert!(check_allowed(
            &request(&[("pragma", "no-cache"), ("cache-control", "max-age=10")]),
            &conf
        ));

        let conf = CacheConf {
            ignore_cache_control: true,
            ..Default::default()
        };
        assert!(check_allowed(&request(&[("cache-control", "no-cache")]), &conf));
    }

    fn stored(now: SystemTime, fresh: u64, cc: Option<&'static str>) -> CacheMeta {
        let mut resp_hdrs = HeaderMap::new();
        if let Some(cc) = cc {
            resp_hdrs.insert(header::CACHE_CONTROL, HeaderValue::from_static(cc));
        }
        CacheMeta::new(
            CacheInfo {
                date: now,
                expire: now + Duration::from_secs(fresh),
                request_time: now,
                response_time: now,
                status: 200,
            },
            resp_hdrs,
            HeaderMap::new(),
        )
    }

    #[test]
    fn test_fresh_for_request() {
        let t = epoch_plus(1_000_000);
        let meta = stored(t, 60, None);
        let later = t + Duration::from_secs(30);

        assert!(fresh_for_request(&meta, None, later));

        let h = headers(&[("cache-control", "max-age=10".to_string())]);
        assert!(!fresh_for_request(&meta, CacheControl::from_headers(&h).as_ref(), later));

        let h = headers(&[("cache-control", "min-fresh=40".to_string())]);
        assert!(!fresh_for_request(&meta, CacheControl::from_headers(&h).as_ref(), later));
        let h = headers(&[("cache-control", "min-fresh=20".to_string())]);
        assert!(fresh_for_request(&meta, CacheControl::from_headers(&h).as_ref(), later));
    }

    #[test]
    fn test_max_stale() {
        let t = epoch_plus(1_000_000);
        let meta = stored(t, 60, None);
        let stale_by_30 = t + Duration::from_secs(90);

        assert!(!fresh_for_request(&meta, None, stale_by_30));

        let h = headers(&[("cache-control", "max-stale".to_string())]);
        assert!(fresh_for_request(&meta, CacheControl::from_headers(&h).as_ref(), stale_by_30));
        let h = headers(&[("cache-control", "max-stale=40".to_string())]);
        assert!(fresh_for_request(&meta, CacheControl::from_headers(&h).as_ref(), stale_by_30));
        let h = headers(&[("cache-control", "max-stale=10".to_string())]);
        assert!(!fresh_for_request(&meta, CacheControl::from_headers(&h).as_ref(), stale_by_30));

        // origin forbids serving stale
        let meta = stored(t, 60, Some("max-age=60, must-revalidate"));
        let h = headers(&[("cache-control", "max-stale".to_string())]);
        assert!(!fresh_for_request(&meta, CacheControl::from_headers(&h).as_ref(), stale_by_30));
    }
}
