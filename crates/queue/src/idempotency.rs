//! Idempotency cache
//!
//! Maps idempotency key to the first-seen timestamp. A key recorded
//! within the TTL rejects later enqueues of the same logical operation.
//! Entries whose timestamp fails to parse are treated as absent and
//! deleted lazily on read.

use chrono::{DateTime, Utc};
use std::time::Duration;
use vital_storage::TypedBox;

use crate::error::Result;

/// TTL-bounded set of recently seen idempotency keys.
pub struct IdempotencyCache {
    entries: TypedBox<String>,
    ttl: Duration,
}

impl IdempotencyCache {
    /// Wrap the idempotency box with the given TTL.
    pub fn new(entries: TypedBox<String>, ttl: Duration) -> Self {
        IdempotencyCache { entries, ttl }
    }

    /// Whether `key` was seen within the TTL.
    ///
    /// Corrupt entries are deleted and read as absent.
    pub fn contains(&self, key: &str, now: DateTime<Utc>) -> bool {
        match self.first_seen(key) {
            Some(seen) => !self.expired(seen, now),
            None => false,
        }
    }

    /// Record `key`; returns `true` when it was new (or expired).
    pub fn record(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        if self.contains(key, now) {
            return Ok(false);
        }
        self.entries.put(key, &now.to_rfc3339())?;
        Ok(true)
    }

    /// Drop expired entries; called at the start of each processing run.
    pub fn cleanup(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut dropped = 0;
        for key in self.entries.keys() {
            let drop = match self.first_seen(&key) {
                Some(seen) => self.expired(seen, now),
                // first_seen already deleted the corrupt entry.
                None => false,
            };
            if drop {
                self.entries.delete(&key)?;
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expired(&self, seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - seen >= ttl,
            Err(_) => false,
        }
    }

    fn first_seen(&self, key: &str) -> Option<DateTime<Utc>> {
        let raw = match self.entries.get(key) {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "unreadable idempotency entry dropped");
                let _ = self.entries.delete(key);
                return None;
            }
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "corrupt idempotency timestamp dropped");
                let _ = self.entries.delete(key);
                None
            }
        }
    }
}
