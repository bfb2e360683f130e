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

//! Set limit on the largest size to cache

use crate::storage::HandleMiss;
use crate::{CacheMeta, MissHandler};
use async_trait::async_trait;
use bytes::Bytes;
use hoard_error::{Error, ErrorType, Result};

/// [MaxFileSizeMissHandler] wraps a MissHandler to enforce a maximum body size that should be
/// written to the MissHandler.
///
/// When the response size is known ahead of time it is checked up front instead. This covers
/// bodies without Content-Length. Hitting the limit fails the write, after which the engine
/// discards the partial entity and keeps passing the body to the client.
pub struct MaxFileSizeMissHandler {
    inner: MissHandler,
    max_file_size_bytes: usize,
    bytes_written: usize,
}

impl MaxFileSizeMissHandler {
    /// Create a new [MaxFileSizeMissHandler] wrapping the given [MissHandler]
    pub fn new(inner: MissHandler, max_file_size_bytes: usize) -> MaxFileSizeMissHandler {
        MaxFileSizeMissHandler {
            inner,
            max_file_size_bytes,
            bytes_written: 0,
        }
    }
}

#[async_trait]
impl HandleMiss for MaxFileSizeMissHandler {
    async fn store_headers(&mut self, meta: &CacheMeta) -> Result<()> {
        self.inner.store_headers(meta).await
    }

    async fn store_body(&mut self, data: Bytes, eof: bool) -> Result<()> {
        // fail if writing the body would exceed the max_file_size_bytes
        if self.bytes_written + data.len() > self.max_file_size_bytes {
            return Error::e_explain(
                ErrorType::ResponseTooLarge,
                format!(
                    "writing data of size {} bytes would exceed max file size of {} bytes",
                    data.len(),
                    self.max_file_size_bytes
                ),
            );
        }

        self.bytes_written += data.len();
        self.inner.store_body(data, eof).await
    }

    async fn commit_entity(self: Box<Self>) -> Result<usize> {
        self.inner.commit_entity().await
    }

    async fn remove_entity(self: Box<Self>) -> Result<()> {
        self.inner.remove_entity().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::{CacheKey, MemCache};
    use once_cell::sync::Lazy;
    use rustracing::span::Span;

    #[tokio::test]
    async fn test_limit() {
        static MEM_CACHE: Lazy<MemCache> = Lazy::new(MemCache::new);
        let span = &Span::inactive().handle();
        let key = CacheKey::new("http://a.com:80/big");
        let inner = MEM_CACHE
            .create_entity(&key, None, span)
            .await
            .unwrap()
            .unwrap();
        let mut miss_handler = MaxFileSizeMissHandler::new(inner, 8);
        miss_handler
            .store_body(Bytes::from_static(b"12345"), false)
            .await
            .unwrap();
        let err = miss_handler
            .store_body(Bytes::from_static(b"6789"), true)
            .await
            .unwrap_err();
        assert_eq!(err.etype(), &ErrorType::ResponseTooLarge);
        Box::new(miss_handler).remove_entity().await.unwrap();
        assert_eq!(MEM_CACHE.pending_writes(), 0);
    }
}
