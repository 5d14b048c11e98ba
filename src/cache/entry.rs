// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Cache namespaces. Logically independent maps sharing one byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Messages,
    Notifications,
    UserPresence,
    SocialFeed,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [
        Self::Messages,
        Self::Notifications,
        Self::UserPresence,
        Self::SocialFeed,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Notifications => "notifications",
            Self::UserPresence => "user_presence",
            Self::SocialFeed => "social_feed",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One cached value plus the metadata eviction scoring needs.
///
/// The stored bytes may be compressed; that is invisible to callers, the
/// cache decompresses on read.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    data: Vec<u8>,
    pub compressed: bool,
    /// Estimated footprint (stored bytes + key)
    pub size_bytes: usize,
    pub inserted_at: Instant,
    pub last_access: Instant,
    pub access_count: u64,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(key_len: usize, data: Vec<u8>, compressed: bool, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            size_bytes: data.len() + key_len,
            data,
            compressed,
            inserted_at: now,
            last_access: now,
            access_count: 0,
            ttl,
        }
    }

    pub fn record_access(&mut self) {
        self.last_access = Instant::now();
        self.access_count = self.access_count.saturating_add(1);
    }

    /// A get issued at or after `inserted_at + ttl` is a guaranteed miss.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.inserted_at + self.ttl
    }

    #[must_use]
    pub fn idle_ms(&self) -> f64 {
        self.last_access.elapsed().as_secs_f64() * 1000.0
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
