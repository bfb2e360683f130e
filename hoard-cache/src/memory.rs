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

//! Hash map based in memory cache
//!
//! For testing only, not for production use

use super::*;
use crate::storage::{HandleHit, HandleMiss};
use crate::trace::SpanHandle;

use async_trait::async_trait;
use bytes::Bytes;
use hoard_error::{Error, ErrorType::*, OkOrErr, Result};
use log::debug;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) struct CacheObject {
    pub meta: Vec<u8>,
    pub body: Arc<Vec<u8>>,
}

pub(crate) struct TempObject {
    pub meta: Option<Vec<u8>>,
    pub body: Vec<u8>,
}

impl TempObject {
    fn new() -> Self {
        TempObject {
            meta: None,
            body: Vec::new(),
        }
    }
}

type TempMap = HashMap<String, HashMap<u64, TempObject>>;

/// Hash map based in memory cache
///
/// For testing only, not for production use.
pub struct MemCache {
    pub(crate) cached: Arc<RwLock<HashMap<String, CacheObject>>>,
    // key -> (temp writer id -> temp object) to support concurrent writers
    pub(crate) temp: Arc<RwLock<TempMap>>,
    pub(crate) last_temp_id: AtomicU64,
    max_entity_size: Option<usize>,
}

impl MemCache {
    /// Create a new [MemCache]
    pub fn new() -> Self {
        MemCache {
            cached: Arc::new(RwLock::new(HashMap::new())),
            temp: Arc::new(RwLock::new(HashMap::new())),
            last_temp_id: AtomicU64::new(0),
            max_entity_size: None,
        }
    }

    /// Create a [MemCache] that declines entities with a body larger than `max`
    pub fn with_max_entity_size(max: usize) -> Self {
        MemCache {
            max_entity_size: Some(max),
            ..Self::new()
        }
    }

    /// Number of committed entities
    pub fn len(&self) -> usize {
        self.cached.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entities being written
    pub fn pending_writes(&self) -> usize {
        self.temp.read().values().map(|m| m.len()).sum()
    }
}

pub struct MemHitHandler {
    meta: Vec<u8>,
    body: Arc<Vec<u8>>,
    done: bool,
}

#[async_trait]
impl HandleHit for MemHitHandler {
    async fn recall_headers(&mut self) -> Result<CacheMeta> {
        CacheMeta::deserialize(&self.meta)
    }

    async fn recall_body(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(Bytes::copy_from_slice(self.body.as_slice())))
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

pub struct MemMissHandler {
    // these are used only in commit_entity() to move data from temp to cache
    key: String,
    temp_id: u64,
    max_entity_size: Option<usize>,
    // key -> cache object
    cache: Arc<RwLock<HashMap<String, CacheObject>>>,
    temp: Arc<RwLock<TempMap>>,
}

impl MemMissHandler {
    fn with_temp<T>(&self, f: impl FnOnce(&mut TempObject) -> Result<T>) -> Result<T> {
        let mut temp = self.temp.write();
        let obj = temp
            .get_mut(&self.key)
            .and_then(|map| map.get_mut(&self.temp_id))
            .or_err(InternalError, "temp object is gone")?;
        f(obj)
    }
}

#[async_trait]
impl HandleMiss for MemMissHandler {
    async fn store_headers(&mut self, meta: &CacheMeta) -> Result<()> {
        let meta = meta.serialize()?;
        self.with_temp(|obj| {
            obj.meta = Some(meta);
            Ok(())
        })
    }

    async fn store_body(&mut self, data: Bytes, _eof: bool) -> Result<()> {
        let max = self.max_entity_size;
        self.with_temp(|obj| {
            if max.is_some_and(|max| obj.body.len() + data.len() > max) {
                return Error::e_explain(ResponseTooLarge, "entity exceeds max size");
            }
            obj.body.extend_from_slice(&data);
            Ok(())
        })
    }

    async fn commit_entity(self: Box<Self>) -> Result<usize> {
        let obj = self
            .temp
            .write()
            .get_mut(&self.key)
            .and_then(|map| map.remove(&self.temp_id))
            .or_err(InternalError, "temp object is gone")?;
        let meta = obj
            .meta
            .ok_or_else(|| Error::storage("commit before store_headers"))?;
        let size = obj.body.len();
        let cache_object = CacheObject {
            meta,
            body: Arc::new(obj.body),
        };
        self.cache.write().insert(self.key.clone(), cache_object);
        debug!("committed {} ({size} bytes)", self.key);
        Ok(size)
    }

    async fn remove_entity(self: Box<Self>) -> Result<()> {
        // the temp object is removed on drop
        Ok(())
    }
}

impl Drop for MemMissHandler {
    fn drop(&mut self) {
        let mut temp = self.temp.write();
        if let Some(map) = temp.get_mut(&self.key) {
            map.remove(&self.temp_id);
            if map.is_empty() {
                temp.remove(&self.key);
            }
        }
    }
}

#[async_trait]
impl Storage for MemCache {
    async fn open_entity(
        &'static self,
        key: &CacheKey,
        _trace: &SpanHandle,
    ) -> Result<Option<HitHandler>> {
        let Some(obj) = self.cached.read().get(key.as_str()).map(|obj| MemHitHandler {
            meta: obj.meta.clone(),
            body: obj.body.clone(),
            done: false,
        }) else {
            return Ok(None);
        };
        Ok(Some(Box::new(obj)))
    }

    async fn create_entity(
        &'static self,
        key: &CacheKey,
        length_hint: Option<usize>,
        _trace: &SpanHandle,
    ) -> Result<Option<MissHandler>> {
        if let (Some(max), Some(len)) = (self.max_entity_size, length_hint) {
            if len > max {
                debug!("declining {key}: {len} > {max}");
                return Ok(None);
            }
        }
        let hash = key.as_str().to_string();
        let temp_id = self.last_temp_id.fetch_add(1, Ordering::Relaxed);
        self.temp
            .write()
            .entry(hash.clone())
            .or_default()
            .insert(temp_id, TempObject::new());
        let miss_handler = MemMissHandler {
            key: hash,
            temp_id,
            max_entity_size: self.max_entity_size,
            cache: self.cached.clone(),
            temp: self.temp.clone(),
        };
        Ok(Some(Box::new(miss_handler)))
    }

    async fn update_meta(
        &'static self,
        key: &CacheKey,
        meta: &CacheMeta,
        _trace: &SpanHandle,
    ) -> Result<bool> {
        let meta = meta.serialize()?;
        match self.cached.write().get_mut(key.as_str()) {
            Some(obj) => {
                obj.meta = meta;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_url(&'static self, key: &CacheKey, _trace: &SpanHandle) -> Result<bool> {
        Ok(self.cached.write().remove(key.as_str()).is_some())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync + 'static) {
        self
    }
}
