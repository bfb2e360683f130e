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

//! Cache backend storage abstraction

use super::{CacheKey, CacheMeta};
use crate::trace::SpanHandle;

use async_trait::async_trait;
use bytes::Bytes;
use hoard_error::Result;
use std::any::Any;

/// Cache storage provider interface
///
/// Any of the async functions may fail. The engine treats a failure as a reason to serve the
/// request uncached, never as a reason to fail the request.
#[async_trait]
pub trait Storage {
    /// Find the committed entity for the given [CacheKey]
    ///
    /// `Ok(None)` means this provider has no such entity.
    async fn open_entity(
        &'static self,
        key: &CacheKey,
        trace: &SpanHandle,
    ) -> Result<Option<HitHandler>>;

    /// Start a new entity for the given [CacheKey].
    ///
    /// `length_hint` is the body size when it is known ahead of time. `Ok(None)` means this
    /// provider declines to store the entity, for example because it is too large.
    async fn create_entity(
        &'static self,
        key: &CacheKey,
        length_hint: Option<usize>,
        trace: &SpanHandle,
    ) -> Result<Option<MissHandler>>;

    /// Replace the metadata of a committed entity, keeping its body.
    ///
    /// `Ok(false)` if the entity does not exist.
    async fn update_meta(
        &'static self,
        key: &CacheKey,
        meta: &CacheMeta,
        trace: &SpanHandle,
    ) -> Result<bool>;

    /// Delete the committed entity for the given key
    ///
    /// `Ok(false)` if there was nothing to delete.
    async fn remove_url(&'static self, key: &CacheKey, trace: &SpanHandle) -> Result<bool>;

    /// Helper function to cast the trait object to concrete types
    fn as_any(&self) -> &(dyn Any + Send + Sync + 'static);
}

/// Reading side of an entity
#[async_trait]
pub trait HandleHit {
    /// Read the stored response headers and timing
    async fn recall_headers(&mut self) -> Result<CacheMeta>;

    /// Read cached body
    ///
    /// Return `None` when no more body to read.
    async fn recall_body(&mut self) -> Result<Option<Bytes>>;

    /// Release whatever the provider holds for this read
    async fn finish(
        self: Box<Self>, // because self is always used as a trait object
    ) -> Result<()>;

    /// Helper function to cast the trait object to concrete types
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

/// Hit Handler
pub type HitHandler = Box<(dyn HandleHit + Sync + Send)>;

/// Writing side of an entity
///
/// Nothing written is visible to readers until [HandleMiss::commit_entity()]. When `self` is
/// dropped without being committed, the provider must discard what was written.
#[async_trait]
pub trait HandleMiss {
    /// Write the response headers and timing
    async fn store_headers(&mut self, meta: &CacheMeta) -> Result<()>;

    /// Write the given body to the storage
    async fn store_body(&mut self, data: Bytes, eof: bool) -> Result<()>;

    /// Make the entity visible to readers, replacing any older entity under the same key.
    ///
    /// Returns the body size stored.
    async fn commit_entity(
        self: Box<Self>, // because self is always used as a trait object
    ) -> Result<usize>;

    /// Discard everything written so far
    async fn remove_entity(self: Box<Self>) -> Result<()>;
}

/// Miss Handler
pub type MissHandler = Box<(dyn HandleMiss + Sync + Send)>;
