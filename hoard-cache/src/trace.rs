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

//! Distributed tracing helpers

use rustracing_jaeger::span::SpanContextState;
use std::time::SystemTime;

use crate::{CacheInfo, CachePhase};

pub use rustracing::tag::Tag;

pub type Span = rustracing::span::Span<SpanContextState>;
pub type SpanHandle = rustracing::span::SpanHandle<SpanContextState>;

#[derive(Debug)]
pub(crate) struct CacheTraceCTX {
    // parent span
    pub cache_span: Span,
    // only spans across multiple calls need to store here
    pub populate_span: Span,
}

impl CacheTraceCTX {
    pub fn new() -> Self {
        CacheTraceCTX {
            cache_span: Span::inactive(),
            populate_span: Span::inactive(),
        }
    }

    pub fn enable(&mut self, cache_span: Span) {
        self.cache_span = cache_span;
    }

    #[inline]
    pub fn child(&self, name: &'static str) -> Span {
        self.cache_span.child(name, |o| o.start())
    }

    pub fn start_populate_span(&mut self) {
        self.populate_span = self.child("populate");
    }

    pub fn get_populate_span(&self) -> SpanHandle {
        self.populate_span.handle()
    }

    pub fn finish_populate_span(&mut self, phase: CachePhase) {
        self.populate_span
            .set_tag(|| Tag::new("phase", phase.as_str()));
        self.populate_span.set_finish_time(SystemTime::now);
    }

    pub fn tag_phase(&mut self, phase: CachePhase) {
        self.cache_span.set_tag(|| Tag::new("phase", phase.as_str()));
    }

    pub fn log_meta(span: &mut Span, info: &CacheInfo) {
        fn ts2epoch(ts: SystemTime) -> f64 {
            ts.duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default() // should never overflow but be safe here
                .as_secs_f64()
        }
        span.set_tags(|| {
            [
                Tag::new("date", ts2epoch(info.date)),
                Tag::new("expire", ts2epoch(info.expire)),
                Tag::new("request_time", ts2epoch(info.request_time)),
                Tag::new("response_time", ts2epoch(info.response_time)),
                Tag::new("status", info.status as i64),
            ]
        });
    }
}
