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

//! The HTTP caching layer for request pipelines.
//!
//! A [CacheEngine] holds what is shared by all requests: the configuration, the storage
//! providers and the cache lock. Each request drives its own [HttpCache] through
//! [HttpCache::cache_lookup()] and, when the origin is contacted, [HttpCache::response_filter()]
//! and [HttpCache::response_body_filter()].

#![allow(clippy::new_without_default)]

use bytes::{Bytes, BytesMut};
use hoard_error::{Error, ErrorType, Result};
use http::header::{HeaderName, CONTENT_LENGTH};
use http::{method::Method, request::Parts as ReqHeader, response::Parts as RespHeader};
use http::StatusCode;
use log::{debug, warn};
use std::time::{Duration, SystemTime};
use trace::CacheTraceCTX;

pub mod cache_control;
pub mod conf;
pub mod filters;
pub mod freshness;
pub mod headers;
pub mod key;
pub mod lock;
pub mod max_file_size;
mod memory;
pub mod meta;
pub mod registry;
pub mod storage;
pub mod trace;

use crate::cache_control::CacheControl;
use crate::conf::UrlPattern;
use crate::filters::Exchange;
use crate::key::UrlParts;
use crate::lock::{CacheKeyLock, CacheLock, LockStatus, Locked, WritePermit};
use crate::max_file_size::MaxFileSizeMissHandler;
pub use conf::CacheConf;
pub use key::CacheKey;
pub use memory::MemCache;
pub use meta::{CacheInfo, CacheMeta};
pub use registry::ProviderRegistry;
pub use storage::{HitHandler, MissHandler, Storage};

/// What every request shares: the configuration, the storage providers and the cache lock
pub struct CacheEngine {
    conf: CacheConf,
    registry: ProviderRegistry,
    // compiled `enable` list with the index of each provider in the registry
    enable: Vec<(UrlPattern, usize)>,
    disable: Vec<UrlPattern>,
    ignore_headers: Vec<HeaderName>,
    cache_lock: Option<CacheLock>,
}

impl CacheEngine {
    /// Validate `conf` against the `registry` and build the engine.
    ///
    /// Fails with a `ConfigurationError` if the configuration is invalid or names a provider
    /// that is not registered.
    pub fn new(conf: CacheConf, registry: ProviderRegistry) -> Result<Self> {
        let conf = conf.validate()?;
        let mut enable = Vec::with_capacity(conf.enable.len());
        for e in conf.enable.iter() {
            let Some(id) = registry.position(&e.provider) else {
                return Error::e_config(format!("unknown storage provider {}", e.provider));
            };
            enable.push((UrlPattern::parse(&e.url)?, id));
        }
        let disable = conf
            .disable
            .iter()
            .map(|url| UrlPattern::parse(url))
            .collect::<Result<Vec<_>>>()?;
        let ignore_headers = conf.ignore_header_names()?;
        let cache_lock = conf.lock.then(|| CacheLock::new(conf.lock_max_age()));
        Ok(CacheEngine {
            conf,
            registry,
            enable,
            disable,
            ignore_headers,
            cache_lock,
        })
    }

    pub fn conf(&self) -> &CacheConf {
        &self.conf
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// The cache lock, `None` if locking is turned off
    pub fn cache_lock(&self) -> Option<&CacheLock> {
        self.cache_lock.as_ref()
    }

    /// The names of the providers a URL may be cached in, in the order they are tried
    pub fn providers_for(&self, url: &UrlParts) -> Vec<&str> {
        self.provider_ids(url)
            .into_iter()
            .map(|id| self.registry.name(id))
            .collect()
    }

    fn provider_ids(&self, url: &UrlParts) -> Vec<usize> {
        let matches = |p: &UrlPattern| p.matches(&url.scheme, &url.host, &url.path);
        if self.disable.iter().any(matches) {
            return vec![];
        }
        let mut ids = vec![];
        for (pattern, id) in self.enable.iter() {
            if matches(pattern) && !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }
}

/// This reflects the phase of HttpCache during the lifetime of a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePhase {
    /// The request is not handled by the cache at all
    Disabled(NoCacheReason),
    /// Nothing is looked up yet
    Uninit,
    /// A fresh stored response is being served
    Hit,
    /// Nothing usable is stored, this request populates the cache
    Miss,
    /// A stale stored response is found and being revalidated
    Stale,
    /// A stale stored response was found, and the origin sent a new one that is being stored
    Expired,
    /// A stale stored response was found, and it was revalidated to be fresh
    Revalidated,
    /// Revalidated, but deemed uncacheable, so the stored response is served once and removed
    RevalidatedNoCache(NoCacheReason),
    /// The origin response is passed through without being stored
    Declined(NoCacheReason),
    /// Storing the origin response failed midway, the partial entity is discarded
    Aborted(NoCacheReason),
    /// The origin response is stored
    Committed,
}

impl CachePhase {
    /// Convert [CachePhase] as `str`, for logging and debugging.
    pub fn as_str(&self) -> &'static str {
        match self {
            CachePhase::Disabled(_) => "disabled",
            CachePhase::Uninit => "uninitialized",
            CachePhase::Hit => "hit",
            CachePhase::Miss => "miss",
            CachePhase::Stale => "stale",
            CachePhase::Expired => "expired",
            CachePhase::Revalidated => "revalidated",
            CachePhase::RevalidatedNoCache(_) => "revalidated-nocache",
            CachePhase::Declined(_) => "declined",
            CachePhase::Aborted(_) => "aborted",
            CachePhase::Committed => "committed",
        }
    }
}

/// The possible reasons for not caching
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NoCacheReason {
    /// Caching is not enabled to begin with
    NeverEnabled,
    /// Only GET and HEAD are looked up
    MethodNotCacheable,
    /// The request URL cannot form a cache key
    KeyNormalization,
    /// No `enable` entry matches the URL, or a `disable` entry does
    UrlNotCacheable,
    /// Origin directives indicated this was not cacheable
    OriginNotCache,
    /// The status is never stored, or only with explicit freshness
    StatusNotCacheable,
    /// The response has no Content-Type
    MissingContentType,
    /// The URL has a query string and the response no explicit freshness
    QueryWithoutExpiry,
    /// The response has neither a validator nor explicit freshness
    NoValidator,
    /// The response is already stale when it arrives
    AlreadyExpired,
    /// `Vary: *`
    VaryAny,
    /// The request has Authorization and the response does not allow sharing it
    AuthorizationRequired,
    /// The request has `Cache-Control: no-store`
    RequestNoStore,
    /// HEAD responses are not stored
    HeadRequest,
    /// Response size was larger than the cache's configured maximum asset size
    ResponseTooLarge,
    /// Due to internal caching storage error
    StorageError,
    /// No provider accepted the entity
    ProviderDeclined,
    /// Due to other types of internal issues
    InternalError,
    /// Another request is populating the same key
    CacheLockBusy,
    /// The client went away while the response was being stored
    ClientAbort,
    /// Other custom defined reasons
    Custom(&'static str),
}

impl NoCacheReason {
    /// Convert [NoCacheReason] as `str`, for logging and debugging.
    pub fn as_str(&self) -> &'static str {
        use NoCacheReason::*;
        match self {
            NeverEnabled => "NeverEnabled",
            MethodNotCacheable => "MethodNotCacheable",
            KeyNormalization => "KeyNormalization",
            UrlNotCacheable => "UrlNotCacheable",
            OriginNotCache => "OriginNotCache",
            StatusNotCacheable => "StatusNotCacheable",
            MissingContentType => "MissingContentType",
            QueryWithoutExpiry => "QueryWithoutExpiry",
            NoValidator => "NoValidator",
            AlreadyExpired => "AlreadyExpired",
            VaryAny => "VaryAny",
            AuthorizationRequired => "AuthorizationRequired",
            RequestNoStore => "RequestNoStore",
            HeadRequest => "HeadRequest",
            ResponseTooLarge => "ResponseTooLarge",
            StorageError => "StorageError",
            ProviderDeclined => "ProviderDeclined",
            InternalError => "InternalError",
            CacheLockBusy => "CacheLockBusy",
            ClientAbort => "ClientAbort",
            Custom(s) => s,
        }
    }

    // how a populator that stops for this reason leaves the lock
    fn lock_status(&self) -> LockStatus {
        use NoCacheReason::*;
        match self {
            // let the next request try to fetch it
            StorageError | InternalError | ClientAbort => LockStatus::TransientError,
            // no need for the lock anymore
            _ => LockStatus::GiveUp,
        }
    }
}

/// Response cacheable decision
#[derive(Debug)]
pub enum RespCacheable {
    Cacheable(CacheMeta),
    Uncacheable(NoCacheReason),
}

impl RespCacheable {
    /// Whether it is cacheable
    #[inline]
    pub fn is_cacheable(&self) -> bool {
        matches!(*self, Self::Cacheable(_))
    }
}

/// The outcome of [HttpCache::cache_lookup()]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    /// The cache does not handle this request
    NotApplicable(NoCacheReason),
    /// Serve [HttpCache::cached_response_header()] and [HttpCache::read_cached_body()].
    ///
    /// `quick` tells whether the rest of the request processing may be skipped.
    Hit { quick: bool },
    /// Forward the request to the origin and pass its response through the response filters
    PassThrough,
}

/// The outcome of [HttpCache::response_filter()]
#[derive(Debug)]
pub enum ResponseAction {
    /// Send the origin response on, through [HttpCache::response_body_filter()]
    PassThrough,
    /// The origin confirmed the stored response. Send this header and then
    /// [HttpCache::read_cached_body()] instead of the origin response.
    ServeCached(RespHeader),
}

/// The state machine for http caching
///
/// This object is used to handle the state and transitions for HTTP caching through the life of a
/// request. Dropping it in the middle of storing a response discards the partial entity and
/// frees the cache lock.
pub struct HttpCache {
    phase: CachePhase,
    engine: &'static CacheEngine,
    // Box the rest so that a disabled HttpCache struct is small
    inner: Option<Box<HttpCacheInner>>,
    traces: CacheTraceCTX,
}

struct HttpCacheInner {
    key: CacheKey,
    // whether the key kept a query string
    has_query: bool,
    req: ReqHeader,
    request_time: SystemTime,
    // the providers the request may use, in order
    candidates: Vec<usize>,
    // once chosen, the request sticks to this provider
    provider: Option<usize>,
    // the stored response found by the lookup
    meta: Option<CacheMeta>,
    body_reader: Option<HitHandler>,
    // the response being stored
    new_meta: Option<CacheMeta>,
    miss_handler: Option<MissHandler>,
    // body held back while the store decision is pending
    buffer: BytesMut,
    block_response: bool,
    lock: Option<WritePermit>,
}

fn copy_req_header(req: &ReqHeader) -> ReqHeader {
    let (mut parts, _) = http::Request::new(()).into_parts();
    parts.method = req.method.clone();
    parts.uri = req.uri.clone();
    parts.version = req.version;
    parts.headers = req.headers.clone();
    parts
}

async fn finish_hit(hit: HitHandler) {
    if let Err(e) = hit.finish().await {
        warn!("failed to finish cache hit: {e}");
    }
}

impl HttpCache {
    /// Create a new [HttpCache] for one request.
    pub fn new(engine: &'static CacheEngine) -> Self {
        HttpCache {
            phase: CachePhase::Uninit,
            engine,
            inner: None,
            traces: CacheTraceCTX::new(),
        }
    }

    /// Return the [CachePhase]
    pub fn phase(&self) -> CachePhase {
        self.phase
    }

    /// Whether the cache handles this request
    pub fn enabled(&self) -> bool {
        !matches!(self.phase, CachePhase::Disabled(_))
    }

    /// Enable distributed tracing
    pub fn enable_tracing(&mut self, parent_span: trace::Span) {
        self.traces.enable(parent_span);
    }

    /// The cache key of the request, once looked up
    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.inner.as_ref().map(|inner| &inner.key)
    }

    /// The name of the provider the request is bound to, if any
    pub fn provider(&self) -> Option<&str> {
        let id = self.inner.as_ref()?.provider?;
        Some(self.engine.registry.name(id))
    }

    // shortcut to access inner, panic if phase is disabled
    #[inline]
    fn inner_mut(&mut self) -> &mut HttpCacheInner {
        match self.inner.as_deref_mut() {
            Some(inner) => inner,
            None => panic!("no cache state in phase {:?}", self.phase),
        }
    }

    fn release_lock(&mut self, status: LockStatus) {
        let Some(cache_lock) = self.engine.cache_lock.as_ref() else {
            return;
        };
        if let Some(inner) = self.inner.as_mut() {
            if let Some(permit) = inner.lock.take() {
                cache_lock.release(&inner.key, permit, status);
            }
        }
    }

    // End caching for this request. Any entity being written is discarded when dropped.
    fn stop(&mut self, phase: CachePhase) {
        let status = match phase {
            CachePhase::Committed => LockStatus::Done,
            CachePhase::Disabled(reason)
            | CachePhase::Declined(reason)
            | CachePhase::Aborted(reason) => {
                debug!(
                    "{}: {} ({})",
                    self.cache_key().map_or("-", |k| k.as_str()),
                    phase.as_str(),
                    reason.as_str()
                );
                self.traces
                    .cache_span
                    .set_tag(|| trace::Tag::new("decline_reason", reason.as_str()));
                reason.lock_status()
            }
            _ => LockStatus::TransientError,
        };
        self.release_lock(status);
        self.traces.finish_populate_span(phase);
        self.traces.tag_phase(phase);
        self.phase = phase;
        self.inner = None;
    }

    /// Look the request up in the cache
    ///
    /// `request_time` is when the request arrived, it is also the time freshness is judged at.
    ///
    /// # Panic
    /// Can only be called once per request.
    pub async fn cache_lookup(&mut self, req: &ReqHeader, request_time: SystemTime) -> LookupResult {
        if self.phase != CachePhase::Uninit {
            panic!("wrong phase {:?}", self.phase);
        }
        let engine = self.engine;
        let conf = engine.conf();

        if !filters::request_cacheable(req) {
            return self.not_applicable(NoCacheReason::MethodNotCacheable);
        }
        let url = match key::normalize(req, conf) {
            Ok(url) => url,
            Err(e) => {
                debug!("not caching {}: {e}", req.uri);
                return self.not_applicable(NoCacheReason::KeyNormalization);
            }
        };
        let candidates = engine.provider_ids(&url);
        if candidates.is_empty() {
            return self.not_applicable(NoCacheReason::UrlNotCacheable);
        }

        let key = url.cache_key();
        self.inner = Some(Box::new(HttpCacheInner {
            key,
            has_query: url.query.is_some(),
            req: copy_req_header(req),
            request_time,
            candidates,
            provider: None,
            meta: None,
            body_reader: None,
            new_meta: None,
            miss_handler: None,
            buffer: BytesMut::new(),
            block_response: false,
            lock: None,
        }));

        let mut span = self.traces.child("lookup");
        let inner = self.inner_mut();
        let found = engine
            .registry
            .open_entity(&inner.candidates, &inner.key, &span.handle())
            .await;
        let (id, mut hit) = match found {
            Ok(Some(found)) => found,
            Ok(None) => {
                span.set_tag(|| trace::Tag::new("found", false));
                return self.cache_miss();
            }
            Err(e) => {
                warn!("cache lookup of {} failed: {e}", inner.key);
                span.set_tag(|| trace::Tag::new("backend_error", true));
                return self.declined(NoCacheReason::StorageError);
            }
        };
        span.set_tag(|| trace::Tag::new("found", true));
        inner.provider = Some(id);

        let meta = match hit.recall_headers().await {
            Ok(meta) => meta,
            Err(e) => {
                warn!("failed to read cached headers of {}: {e}", inner.key);
                span.set_tag(|| trace::Tag::new("backend_error", true));
                finish_hit(hit).await;
                return self.declined(NoCacheReason::StorageError);
            }
        };
        CacheTraceCTX::log_meta(&mut span, meta.info());

        if !meta.vary().matches(meta.request_headers(), &req.headers) {
            debug!("stored variant of {} does not match the request", inner.key);
            finish_hit(hit).await;
            return self.cache_miss();
        }

        let req_cache_control = if conf.ignore_cache_control {
            None
        } else {
            CacheControl::from_req_headers(req)
        };
        let fresh = freshness::fresh_for_request(&meta, req_cache_control.as_ref(), request_time);
        span.set_tag(|| trace::Tag::new("fresh", fresh));

        if fresh {
            if freshness::check_allowed(req, conf) {
                inner.meta = Some(meta);
                inner.body_reader = Some(hit);
                self.phase = CachePhase::Hit;
                self.traces.tag_phase(self.phase);
                return LookupResult::Hit {
                    quick: conf.quick_handler,
                };
            }
            // the client insists on a response from the origin
            finish_hit(hit).await;
            return self.cache_miss();
        }

        if inner.req.method == Method::HEAD {
            finish_hit(hit).await;
            return self.declined(NoCacheReason::HeadRequest);
        }
        if !self.try_lock() {
            finish_hit(hit).await;
            return self.declined(NoCacheReason::CacheLockBusy);
        }
        let inner = self.inner_mut();
        inner.meta = Some(meta);
        inner.body_reader = Some(hit);
        self.phase = CachePhase::Stale;
        self.traces.tag_phase(self.phase);
        LookupResult::PassThrough
    }

    fn not_applicable(&mut self, reason: NoCacheReason) -> LookupResult {
        self.stop(CachePhase::Disabled(reason));
        LookupResult::NotApplicable(reason)
    }

    fn declined(&mut self, reason: NoCacheReason) -> LookupResult {
        self.stop(CachePhase::Declined(reason));
        LookupResult::PassThrough
    }

    fn cache_miss(&mut self) -> LookupResult {
        if self.inner_mut().req.method == Method::HEAD {
            return self.declined(NoCacheReason::HeadRequest);
        }
        if !self.try_lock() {
            return self.declined(NoCacheReason::CacheLockBusy);
        }
        self.phase = CachePhase::Miss;
        self.traces.tag_phase(self.phase);
        LookupResult::PassThrough
    }

    // Whether this request may populate the key. Never waits.
    fn try_lock(&mut self) -> bool {
        let Some(cache_lock) = self.engine.cache_lock.as_ref() else {
            return true;
        };
        let inner = self.inner_mut();
        match cache_lock.lock(&inner.key) {
            Locked::Write(permit) => {
                inner.lock = Some(permit);
                true
            }
            Locked::Busy(age) => {
                debug!("{} is being populated for {age:?}", inner.key);
                false
            }
        }
    }

    /// The header of the stored response to serve, with `Age` set
    ///
    /// `None` when the request is not served from the cache.
    pub fn cached_response_header(&self) -> Option<RespHeader> {
        match self.phase {
            CachePhase::Hit => {
                let inner = self.inner.as_ref()?;
                let now = inner.request_time;
                inner.meta.as_ref().map(|meta| meta.response_header(now))
            }
            CachePhase::Revalidated | CachePhase::RevalidatedNoCache(_) => {
                let meta = self.inner.as_ref()?.meta.as_ref()?;
                Some(meta.response_header(meta.info().response_time))
            }
            _ => None,
        }
    }

    /// Read the next chunk of the stored body
    ///
    /// `Ok(None)` when the body is fully read.
    pub async fn read_cached_body(&mut self) -> Result<Option<Bytes>> {
        match self.phase {
            CachePhase::Hit | CachePhase::Revalidated | CachePhase::RevalidatedNoCache(_) => {}
            _ => {
                return Error::e_explain(
                    ErrorType::InternalError,
                    format!("no cached body in phase {}", self.phase.as_str()),
                )
            }
        }
        let inner = self.inner_mut();
        let Some(reader) = inner.body_reader.as_mut() else {
            // already finished
            return Ok(None);
        };
        let body = reader.recall_body().await?;
        if body.is_none() {
            if let Some(hit) = inner.body_reader.take() {
                finish_hit(hit).await;
            }
            if let CachePhase::RevalidatedNoCache(_) = self.phase {
                self.remove_stored().await;
            }
        }
        Ok(body)
    }

    /// Adjust the request sent to the origin
    ///
    /// A request that is going to populate the cache asks for the full response, and a
    /// revalidation asks with the validators of the stored response.
    pub fn upstream_request_filter(&self, req: &mut ReqHeader) {
        match self.phase {
            CachePhase::Miss => filters::upstream::request_filter(req, None),
            CachePhase::Stale => {
                let meta = self.inner.as_ref().and_then(|inner| inner.meta.as_ref());
                filters::upstream::request_filter(req, meta)
            }
            _ => {}
        }
    }

    /// Decide what to do with the origin response header
    ///
    /// `response_time` is when the header arrived.
    pub async fn response_filter(
        &mut self,
        resp: &RespHeader,
        response_time: SystemTime,
    ) -> ResponseAction {
        match self.phase {
            CachePhase::Stale => {
                if resp.status == StatusCode::NOT_MODIFIED {
                    return self.revalidate(resp, response_time).await;
                }
                // a full response replaces the stale one
                if let Some(hit) = self.inner_mut().body_reader.take() {
                    finish_hit(hit).await;
                }
                self.phase = CachePhase::Expired;
                self.start_populate(resp, response_time).await;
            }
            CachePhase::Miss => self.start_populate(resp, response_time).await,
            _ => {}
        }
        ResponseAction::PassThrough
    }

    fn exchange(&mut self, response_time: SystemTime) -> Exchange {
        Exchange {
            request_time: self.inner_mut().request_time,
            response_time,
        }
    }

    async fn revalidate(&mut self, resp: &RespHeader, response_time: SystemTime) -> ResponseAction {
        let engine = self.engine;
        let exchange = self.exchange(response_time);
        let mut span = self.traces.child("revalidate");
        let inner = self.inner_mut();
        let Some(mut stored) = inner.meta.take() else {
            self.stop(CachePhase::Aborted(NoCacheReason::InternalError));
            return ResponseAction::PassThrough;
        };

        let (mut merged, _) = http::Response::new(()).into_parts();
        merged.status = stored.status();
        merged.headers = filters::revalidate_merge_header(
            stored.response_headers(),
            &resp.headers,
            response_time,
        );
        let cacheable = filters::resp_cacheable(
            &inner.req,
            &merged,
            inner.has_query,
            exchange,
            engine.conf(),
            &engine.ignore_headers,
        );

        match cacheable {
            RespCacheable::Cacheable(fresh) => {
                stored.refresh(&fresh);
                CacheTraceCTX::log_meta(&mut span, stored.info());
                let mut status = LockStatus::Done;
                if let Some(id) = inner.provider {
                    match engine
                        .registry
                        .storage(id)
                        .update_meta(&inner.key, &stored, &span.handle())
                        .await
                    {
                        Ok(updated) => {
                            if !updated {
                                debug!("{} was removed before it got revalidated", inner.key);
                            }
                            span.set_tag(|| trace::Tag::new("updated", updated));
                        }
                        Err(e) => {
                            warn!("failed to update cache meta of {}: {e}", inner.key);
                            span.set_tag(|| trace::Tag::new("backend_error", true));
                            status = LockStatus::TransientError;
                        }
                    }
                }
                let header = stored.response_header(response_time);
                inner.meta = Some(stored);
                self.release_lock(status);
                self.phase = CachePhase::Revalidated;
                self.traces.tag_phase(self.phase);
                ResponseAction::ServeCached(header)
            }
            RespCacheable::Uncacheable(reason) => {
                let stored = CacheMeta::new(
                    *stored.info(),
                    merged.headers,
                    stored.request_headers().clone(),
                );
                let header = stored.response_header(response_time);
                inner.meta = Some(stored);
                self.release_lock(reason.lock_status());
                self.phase = CachePhase::RevalidatedNoCache(reason);
                self.traces.tag_phase(self.phase);
                ResponseAction::ServeCached(header)
            }
        }
    }

    async fn start_populate(&mut self, resp: &RespHeader, response_time: SystemTime) {
        let engine = self.engine;
        let conf = engine.conf();
        let exchange = self.exchange(response_time);
        let inner = self.inner_mut();
        let cacheable = filters::resp_cacheable(
            &inner.req,
            resp,
            inner.has_query,
            exchange,
            conf,
            &engine.ignore_headers,
        );
        let meta = match cacheable {
            RespCacheable::Cacheable(meta) => meta,
            RespCacheable::Uncacheable(reason) => {
                if self.phase == CachePhase::Expired {
                    // the stale response must not be served anymore
                    self.remove_stored().await;
                }
                self.stop(CachePhase::Declined(reason));
                return;
            }
        };

        let content_length = resp
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok());
        if let (Some(max), Some(len)) = (conf.max_file_size_bytes, content_length) {
            if len > max {
                self.stop(CachePhase::Declined(NoCacheReason::ResponseTooLarge));
                return;
            }
        }

        self.traces.start_populate_span();
        let inner = self.inner_mut();
        inner.new_meta = Some(meta);
        match content_length {
            Some(len) => {
                self.start_entity(Some(len)).await;
            }
            // hold the body back until its size is known or large enough to decide
            None => inner.block_response = true,
        }
    }

    // Create the entity and write its headers. False when population stopped instead.
    async fn start_entity(&mut self, length_hint: Option<usize>) -> bool {
        let engine = self.engine;
        let span = self.traces.get_populate_span();
        let inner = self.inner_mut();
        let candidates = match inner.provider {
            Some(id) => vec![id],
            None => inner.candidates.clone(),
        };
        let created = engine
            .registry
            .create_entity(&candidates, &inner.key, length_hint, &span)
            .await;
        let (id, miss) = match created {
            Ok(Some(created)) => created,
            Ok(None) => {
                self.stop(CachePhase::Declined(NoCacheReason::ProviderDeclined));
                return false;
            }
            Err(e) => {
                warn!("failed to create cache entity {}: {e}", inner.key);
                self.stop(CachePhase::Aborted(NoCacheReason::StorageError));
                return false;
            }
        };
        inner.provider = Some(id);
        let mut miss: MissHandler = match engine.conf.max_file_size_bytes {
            Some(max) => Box::new(MaxFileSizeMissHandler::new(miss, max)),
            None => miss,
        };
        let Some(meta) = inner.new_meta.as_ref() else {
            self.stop(CachePhase::Aborted(NoCacheReason::InternalError));
            return false;
        };
        if let Err(e) = miss.store_headers(meta).await {
            warn!("failed to store cache headers of {}: {e}", inner.key);
            self.stop(CachePhase::Aborted(NoCacheReason::StorageError));
            return false;
        }
        inner.miss_handler = Some(miss);
        true
    }

    /// Pass a chunk of the origin response body through the cache
    ///
    /// Returns what to send to the client now. While the decision to store a response
    /// without `Content-Length` is pending, up to `max_buffer_bytes` of body is held back and
    /// `None` is returned. Whatever happens to the stored copy, the bytes returned over the
    /// whole response are exactly the bytes given.
    pub async fn response_body_filter(&mut self, data: Option<Bytes>, eof: bool) -> Option<Bytes> {
        if !matches!(self.phase, CachePhase::Miss | CachePhase::Expired) {
            return data;
        }
        let engine = self.engine;
        let conf = engine.conf();
        let inner = self.inner_mut();

        let data = if inner.block_response {
            if let Some(d) = data.as_ref() {
                inner.buffer.extend_from_slice(d);
            }
            let buffered = inner.buffer.len();
            if !eof && buffered <= conf.max_buffer_bytes {
                return None;
            }
            inner.block_response = false;
            let held = inner.buffer.split().freeze();
            let held = (!held.is_empty()).then_some(held);
            if conf.max_file_size_bytes.is_some_and(|max| buffered > max) {
                self.stop(CachePhase::Declined(NoCacheReason::ResponseTooLarge));
                return held;
            }
            let length_hint = eof.then_some(buffered);
            if !self.start_entity(length_hint).await {
                return held;
            }
            held
        } else {
            data
        };

        if let Some(d) = data.as_ref() {
            if !self.store_body(d.clone(), eof).await {
                return data;
            }
        }
        if eof {
            self.commit().await;
        }
        data
    }

    async fn store_body(&mut self, data: Bytes, eof: bool) -> bool {
        let inner = self.inner_mut();
        let Some(miss) = inner.miss_handler.as_mut() else {
            return false;
        };
        if let Err(e) = miss.store_body(data, eof).await {
            let reason = if *e.etype() == ErrorType::ResponseTooLarge {
                debug!("{} is too large to store: {e}", inner.key);
                NoCacheReason::ResponseTooLarge
            } else {
                warn!("failed to store cache body of {}: {e}", inner.key);
                NoCacheReason::StorageError
            };
            self.abort_population(reason).await;
            return false;
        }
        true
    }

    async fn commit(&mut self) {
        let inner = self.inner_mut();
        let Some(miss) = inner.miss_handler.take() else {
            return;
        };
        match miss.commit_entity().await {
            Ok(size) => {
                debug!("stored {} ({size} bytes)", inner.key);
                self.stop(CachePhase::Committed);
            }
            Err(e) => {
                warn!("failed to commit cache entity {}: {e}", inner.key);
                self.stop(CachePhase::Aborted(NoCacheReason::StorageError));
            }
        }
    }

    async fn abort_population(&mut self, reason: NoCacheReason) {
        if let Some(miss) = self.inner.as_mut().and_then(|inner| inner.miss_handler.take()) {
            if let Err(e) = miss.remove_entity().await {
                warn!("failed to discard partial cache entity: {e}");
            }
        }
        self.stop(CachePhase::Aborted(reason));
    }

    // Remove the entity this request found
    async fn remove_stored(&mut self) {
        let engine = self.engine;
        let mut span = self.traces.child("remove");
        let inner = self.inner_mut();
        let Some(id) = inner.provider else {
            return;
        };
        match engine
            .registry
            .storage(id)
            .remove_url(&inner.key, &span.handle())
            .await
        {
            Ok(removed) => span.set_tag(|| trace::Tag::new("removed", removed)),
            Err(e) => {
                warn!("failed to remove {}: {e}", inner.key);
                span.set_tag(|| trace::Tag::new("backend_error", true));
            }
        }
    }

    /// The client went away
    ///
    /// A response being stored is discarded, a stored response being served is released.
    pub async fn abort(&mut self) {
        match self.phase {
            CachePhase::Miss | CachePhase::Expired | CachePhase::Stale => {
                self.abort_population(NoCacheReason::ClientAbort).await
            }
            CachePhase::Hit | CachePhase::Revalidated | CachePhase::RevalidatedNoCache(_) => {
                if let Some(hit) = self.inner.as_mut().and_then(|i| i.body_reader.take()) {
                    finish_hit(hit).await;
                }
            }
            _ => {}
        }
    }
}

impl Drop for HttpCache {
    fn drop(&mut self) {
        // population never finished, let the next request take over right away
        self.release_lock(LockStatus::TransientError);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::CacheEnable;
    use once_cell::sync::Lazy;

    static MEM: Lazy<MemCache> = Lazy::new(MemCache::new);
    static DISK: Lazy<MemCache> = Lazy::new(MemCache::new);

    fn registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register("mem", &*MEM).unwrap();
        registry.register("disk", &*DISK).unwrap();
        registry
    }

    fn enable(provider: &str, url: &str) -> CacheEnable {
        CacheEnable {
            provider: provider.to_string(),
            url: url.to_string(),
        }
    }

    fn url(u: &str) -> UrlParts {
        let (req, _) = http::Request::get(u).body(()).unwrap().into_parts();
        UrlParts::from_request(&req).unwrap()
    }

    #[test]
    fn test_engine_rejects_bad_conf() {
        let conf = CacheConf {
            enable: vec![enable("ssd", "/")],
            ..Default::default()
        };
        let err = CacheEngine::new(conf, registry()).err().unwrap();
        assert_eq!(*err.etype(), ErrorType::ConfigurationError);

        let conf = CacheConf {
            min_expire_secs: 10,
            max_expire_secs: 5,
            ..Default::default()
        };
        assert!(CacheEngine::new(conf, registry()).is_err());
    }

    #[test]
    fn test_providers_for() {
        let conf = CacheConf {
            enable: vec![
                enable("disk", "/static"),
                enable("mem", "/"),
                enable("disk", "http://example.com/"),
            ],
            disable: vec!["/static/private".to_string()],
            ..Default::default()
        };
        let engine = CacheEngine::new(conf, registry()).unwrap();
        assert!(engine.cache_lock().is_some());

        assert_eq!(
            engine.providers_for(&url("http://example.com/static/a.css")),
            vec!["disk", "mem"]
        );
        assert_eq!(
            engine.providers_for(&url("http://other.com/static/a.css")),
            vec!["disk", "mem"]
        );
        assert_eq!(engine.providers_for(&url("http://other.com/a")), vec!["mem"]);
        assert_eq!(
            engine.providers_for(&url("http://example.com/a")),
            vec!["mem", "disk"]
        );
        assert!(engine
            .providers_for(&url("http://example.com/static/private/x"))
            .is_empty());
    }

    #[test]
    fn test_lock_disabled() {
        let conf = CacheConf {
            enable: vec![enable("mem", "/")],
            lock: false,
            ..Default::default()
        };
        let engine = CacheEngine::new(conf, registry()).unwrap();
        assert!(engine.cache_lock().is_none());
    }

    #[test]
    fn test_reason_lock_status() {
        assert_eq!(
            NoCacheReason::StorageError.lock_status(),
            LockStatus::TransientError
        );
        assert_eq!(
            NoCacheReason::ClientAbort.lock_status(),
            LockStatus::TransientError
        );
        assert_eq!(
            NoCacheReason::OriginNotCache.lock_status(),
            LockStatus::GiveUp
        );
        assert_eq!(NoCacheReason::Custom("x").as_str(), "x");
    }

    #[tokio::test]
    async fn test_not_applicable() {
        static ENGINE: Lazy<CacheEngine> = Lazy::new(|| {
            let conf = CacheConf {
                enable: vec![enable("mem", "/cached")],
                ..Default::default()
            };
            CacheEngine::new(conf, registry()).unwrap()
        });
        let now = SystemTime::now();

        let (req, _) = http::Request::post("http://example.com/cached")
            .body(())
            .unwrap()
            .into_parts();
        let mut cache = HttpCache::new(&ENGINE);
        assert_eq!(
            cache.cache_lookup(&req, now).await,
            LookupResult::NotApplicable(NoCacheReason::MethodNotCacheable)
        );
        assert!(!cache.enabled());

        let (req, _) = http::Request::get("/cached").body(()).unwrap().into_parts();
        let mut cache = HttpCache::new(&ENGINE);
        assert_eq!(
            cache.cache_lookup(&req, now).await,
            LookupResult::NotApplicable(NoCacheReason::KeyNormalization)
        );

        let (req, _) = http::Request::get("http://example.com/other")
            .body(())
            .unwrap()
            .into_parts();
        let mut cache = HttpCache::new(&ENGINE);
        assert_eq!(
            cache.cache_lookup(&req, now).await,
            LookupResult::NotApplicable(NoCacheReason::UrlNotCacheable)
        );
        // the body passes through untouched
        let body = Bytes::from_static(b"hello");
        assert_eq!(
            cache.response_body_filter(Some(body.clone()), true).await,
            Some(body)
        );
    }
}
