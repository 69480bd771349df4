// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The Active Address Registry.
//!
//! A linearizable keyed set enforcing the invariant that any
//! `(protocol, address, version)` triple is read or written by at most one
//! execution at a time. This is the only globally-coordinated state on the
//! hot path; everything else is per-execution. The whole reservation set
//! for an execution is taken atomically - either every key is granted or
//! none are.
//!
//! In a clustered deployment the same interface is backed by a
//! consensus-providing store; the in-process implementation is a single
//! guarded map, which is trivially linearizable.

use crate::address::ExecutionId;
use crate::definition::EntityRef;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reservation key: the identity of an external source or destination.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressKey {
    /// Protocol handler.
    pub protocol: String,
    /// Protocol-specific address.
    pub address: String,
    /// Entity version.
    pub version: String,
}

impl AddressKey {
    /// Key of an external entity reference.
    pub fn of(entity: &EntityRef) -> Self {
        Self {
            protocol: entity.protocol.clone(),
            address: entity.address.clone(),
            version: entity.version.to_string(),
        }
    }
}

/// Who holds a reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Holding execution.
    pub execution_id: ExecutionId,
    /// Flow that execution runs.
    pub flow_id: String,
}

/// Linearizable `(protocol, address, version) -> execution` reservation map.
#[derive(Default)]
pub struct ActiveAddressRegistry {
    held: Mutex<HashMap<AddressKey, Reservation>>,
}

impl ActiveAddressRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically reserve every key for an execution. On any conflict
    /// nothing is reserved and the error names the first contested key and
    /// its holder.
    ///
    /// Re-reserving a key already held by the *same* execution is a no-op,
    /// which makes recovery's re-reservation pass idempotent.
    pub fn reserve_all(
        &self,
        keys: &[AddressKey],
        execution_id: ExecutionId,
        flow_id: &str,
    ) -> Result<()> {
        let mut held = self.held.lock();
        for key in keys {
            if let Some(existing) = held.get(key) {
                if existing.execution_id != execution_id {
                    return Err(Error::AddressConflict {
                        protocol: key.protocol.clone(),
                        address: key.address.clone(),
                        version: key.version.clone(),
                        holder: existing.execution_id.to_string(),
                    });
                }
            }
        }
        for key in keys {
            held.insert(
                key.clone(),
                Reservation {
                    execution_id,
                    flow_id: flow_id.to_string(),
                },
            );
        }
        Ok(())
    }

    /// Release every key held by an execution. Idempotent.
    pub fn release_execution(&self, execution_id: ExecutionId) -> usize {
        let mut held = self.held.lock();
        let before = held.len();
        held.retain(|_, r| r.execution_id != execution_id);
        before - held.len()
    }

    /// Current holder of a key, if any.
    pub fn holder(&self, key: &AddressKey) -> Option<Reservation> {
        self.held.lock().get(key).cloned()
    }

    /// Number of keys an execution currently holds.
    pub fn held_by(&self, execution_id: ExecutionId) -> usize {
        self.held
            .lock()
            .values()
            .filter(|r| r.execution_id == execution_id)
            .count()
    }
}
