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

//! Named storage providers and the order they are tried in

use crate::storage::{HitHandler, MissHandler, Storage};
use crate::trace::SpanHandle;
use crate::CacheKey;

use hoard_error::{Context, Error, Result};
use log::debug;

/// A storage provider as held by the registry
pub type Provider = &'static (dyn Storage + Sync);

/// The set of storage providers, by name
///
/// Which providers a request may use, and in which order, comes from the `enable` list of the
/// configuration. The registry only dispatches to them.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<(String, Provider)>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry { providers: vec![] }
    }

    /// Add a provider under `name`. Names are unique.
    pub fn register<S: Into<String>>(&mut self, name: S, storage: Provider) -> Result<()> {
        let name = name.into();
        if self.contains(&name) {
            return Error::e_config(format!("storage provider {name} registered twice"));
        }
        debug!("registered storage provider {name}");
        self.providers.push((name, storage));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Provider> {
        self.position(name).map(|id| self.providers[id].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.providers.iter().position(|(n, _)| n == name)
    }

    pub(crate) fn name(&self, id: usize) -> &str {
        &self.providers[id].0
    }

    pub(crate) fn storage(&self, id: usize) -> Provider {
        self.providers[id].1
    }

    /// Look the key up in each candidate provider in order
    ///
    /// A miss moves on to the next provider. An error stops the search: a broken backend must
    /// not look like a miss. Returns the id of the provider that had the entity.
    pub(crate) async fn open_entity(
        &self,
        candidates: &[usize],
        key: &CacheKey,
        trace: &SpanHandle,
    ) -> Result<Option<(usize, HitHandler)>> {
        for &id in candidates {
            let found = self
                .storage(id)
                .open_entity(key, trace)
                .await
                .err_context(|| format!("provider {} failed to open {key}", self.name(id)))?;
            if let Some(hit) = found {
                return Ok(Some((id, hit)));
            }
        }
        Ok(None)
    }

    /// Create the entity in the first candidate provider that accepts it
    ///
    /// Same ordering and error rules as [Self::open_entity()].
    pub(crate) async fn create_entity(
        &self,
        candidates: &[usize],
        key: &CacheKey,
        length_hint: Option<usize>,
        trace: &SpanHandle,
    ) -> Result<Option<(usize, MissHandler)>> {
        for &id in candidates {
            let created = self
                .storage(id)
                .create_entity(key, length_hint, trace)
                .await
                .err_context(|| format!("provider {} failed to create {key}", self.name(id)))?;
            match created {
                Some(miss) => return Ok(Some((id, miss))),
                None => debug!("provider {} declined {key}", self.name(id)),
            }
        }
        Ok(None)
    }
}
