// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The shared-memory data-passing store.
//!
//! Keys are [`MemoryAddress`]es; values are immutable blobs written exactly
//! once by the producing step's result. Reference counts track downstream
//! consumers: the scheduler acquires one reference per consumer when the
//! producer completes and releases it when the consumer finishes. A count
//! reaching zero does not evict immediately - the entry lingers for a
//! configurable grace window so retries and recovery can still read it.
//!
//! Branch isolation needs no enforcement here: the scheduler only ever
//! hands out addresses scoped to the requesting execution and branch, so
//! the keyspace partitions by construction.

use crate::address::{ExecutionId, MemoryAddress};
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metadata stored with every entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryMeta {
    /// Schema name of the payload.
    pub schema: String,
    /// Payload size in bytes.
    pub size: usize,
    /// CRC32 of the payload, for cheap corruption checks on read-back.
    pub checksum: u32,
}

struct StoredEntry {
    payload: Arc<Vec<u8>>,
    meta: EntryMeta,
    refs: AtomicI64,
    evictable_at: parking_lot::Mutex<Option<Instant>>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.refs.load(Ordering::Acquire) <= 0
            && self
                .evictable_at
                .lock()
                .map_or(false, |deadline| now >= deadline)
    }
}

/// Execution-local keyed blob store with reference-counted GC.
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    grace: Duration,
}

impl MemoryStore {
    /// A store whose zero-reference entries linger for `grace`.
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            grace,
        }
    }

    /// Write a payload under an address. Fails with
    /// [`Error::AddressOccupied`] if a live entry already exists - entries
    /// are write-once.
    pub fn put(&self, addr: &MemoryAddress, payload: Vec<u8>, schema: impl Into<String>) -> Result<EntryMeta> {
        let key = addr.to_string();
        self.evict_if_expired(&key);

        let meta = EntryMeta {
            schema: schema.into(),
            size: payload.len(),
            checksum: crc32fast::hash(&payload),
        };
        let entry = StoredEntry {
            payload: Arc::new(payload),
            meta: meta.clone(),
            refs: AtomicI64::new(0),
            evictable_at: parking_lot::Mutex::new(Some(Instant::now() + self.grace)),
        };
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Err(Error::AddressOccupied {
                address: occupied.key().clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(meta)
            }
        }
    }

    /// Read the payload at an address.
    pub fn get(&self, addr: &MemoryAddress) -> Result<Arc<Vec<u8>>> {
        let key = addr.to_string();
        self.evict_if_expired(&key);
        self.entries
            .get(&key)
            .map(|e| Arc::clone(&e.payload))
            .ok_or(Error::AddressNotFound { address: key })
    }

    /// Metadata of the entry at an address.
    pub fn meta(&self, addr: &MemoryAddress) -> Result<EntryMeta> {
        let key = addr.to_string();
        self.entries
            .get(&key)
            .map(|e| e.meta.clone())
            .ok_or(Error::AddressNotFound { address: key })
    }

    /// Take a reference on behalf of a downstream consumer.
    pub fn acquire(&self, addr: &MemoryAddress) -> Result<()> {
        let key = addr.to_string();
        let entry = self
            .entries
            .get(&key)
            .ok_or(Error::AddressNotFound { address: key })?;
        entry.refs.fetch_add(1, Ordering::AcqRel);
        *entry.evictable_at.lock() = None;
        Ok(())
    }

    /// Drop a consumer's reference. Reaching zero arms the grace timer;
    /// the entry stays readable until it elapses.
    pub fn release(&self, addr: &MemoryAddress) -> Result<()> {
        let key = addr.to_string();
        let entry = self
            .entries
            .get(&key)
            .ok_or(Error::AddressNotFound { address: key })?;
        let remaining = entry.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining <= 0 {
            *entry.evictable_at.lock() = Some(Instant::now() + self.grace);
        }
        Ok(())
    }

    /// Remove every entry owned by an execution, grace or not. Called once
    /// the execution is terminal and telemetry has flushed.
    pub fn purge_execution(&self, execution_id: ExecutionId) {
        let prefix = format!("{execution_id}:");
        self.entries.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Drop every expired zero-reference entry. Cheap enough to call from
    /// the orchestrator's housekeeping tick.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    /// Number of live entries (expired-but-unswept entries included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current reference count of an address, for introspection and tests.
    pub fn ref_count(&self, addr: &MemoryAddress) -> Option<i64> {
        self.entries
            .get(&addr.to_string())
            .map(|e| e.refs.load(Ordering::Acquire))
    }

    fn evict_if_expired(&self, key: &str) {
        let now = Instant::now();
        let expired = self
            .entries
            .get(key)
            .map_or(false, |entry| entry.is_expired(now));
        if expired {
            self.entries.remove(key);
        }
    }
}

/// Periodic GC loop; spawn alongside the orchestrator.
pub async fn run_gc(store: Arc<MemoryStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let evicted = store.sweep();
        if evicted > 0 {
            tracing::debug!(evicted, "memory store swept expired entries");
        }
    }
}
