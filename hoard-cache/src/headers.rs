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

//! Which headers may be stored and which request headers select a variant

use http::header::{self, HeaderMap, HeaderName};

/// Whether this header only applies to a single connection
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name == header::PROXY_AUTHENTICATE
        || name == header::TE
        || name == header::TRAILER
        || name == header::TRANSFER_ENCODING
        || name == header::UPGRADE
        || name.as_str() == "keep-alive"
}

// RFC 9110 7.6.1: headers named in Connection are hop-by-hop too
fn connection_listed(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect()
}

/// Copy `headers` without hop-by-hop headers and without `ignore`d ones
pub fn strip_unstorable(headers: &HeaderMap, ignore: &[HeaderName]) -> HeaderMap {
    let listed = connection_listed(headers);
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) || listed.contains(name) || ignore.contains(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// The response headers to persist with an entity
///
/// `None` when the response cannot be stored at all: a stored entity without Content-Type
/// could not be served faithfully.
pub fn storable_response_headers(headers: &HeaderMap, ignore: &[HeaderName]) -> Option<HeaderMap> {
    if !headers.contains_key(header::CONTENT_TYPE) {
        return None;
    }
    Some(strip_unstorable(headers, ignore))
}

/// The request headers to persist with an entity: the content negotiation headers plus the
/// headers the response varies on.
///
/// Headers named by `Vary` are kept even when `ignore`d, later lookups are matched on them.
pub fn storable_request_headers(
    headers: &HeaderMap,
    vary: &[HeaderName],
    ignore: &[HeaderName],
) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in strip_unstorable(headers, &[]).iter() {
        let keep = if vary.contains(name) {
            true
        } else {
            is_negotiation(name) && !ignore.contains(name)
        };
        if keep {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn is_negotiation(name: &HeaderName) -> bool {
    name == header::ACCEPT
        || name == header::ACCEPT_CHARSET
        || name == header::ACCEPT_ENCODING
        || name == header::ACCEPT_LANGUAGE
}

/// The parsed `Vary` of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vary {
    /// `Vary: *`, every request is a different variant
    Any,
    /// The request headers that select the variant, possibly none
    Headers(Vec<HeaderName>),
}

impl Vary {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut names = vec![];
        for value in headers.get_all(header::VARY).iter() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if name == "*" {
                    return Vary::Any;
                }
                if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        Vary::Headers(names)
    }

    pub fn names(&self) -> &[HeaderName] {
        match self {
            Vary::Any => &[],
            Vary::Headers(names) => names,
        }
    }

    /// Whether a stored variant, chosen by `stored` request headers, can answer a request
    /// with `current` headers.
    pub fn matches(&self, stored: &HeaderMap, current: &HeaderMap) -> bool {
        match self {
            Vary::Any => false,
            Vary::Headers(names) => names.iter().all(|name| {
                stored
                    .get_all(name)
                    .iter()
                    .eq(current.get_all(name).iter())
            }),
        }
    }
}
