use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::tags::structures::{PlcName, Quality, TagRecord, TagValue};

/// Fields a `PATCH` may touch. Everything else is fixed at creation time.
#[derive(Debug, Default, Clone)]
pub struct TagPatch {
    pub value: Option<TagValue>,
    pub writable: Option<bool>,
}

/// Authoritative in-memory model of every tag. Safe for many concurrent
/// readers and writers; each record mutates under its own shard lock, so
/// readers observe whole records only.
#[derive(Debug, Clone, Default)]
pub struct TagStore {
    tags: Arc<DashMap<String, TagRecord>>,
}

impl TagStore {
    pub fn new() -> Self {
        TagStore {
            tags: Arc::new(DashMap::new()),
        }
    }

    /// Atomic insert. The value shape must already match the declared
    /// datatype; a fresh record must not claim to have been read.
    pub fn insert(&self, record: TagRecord) -> Result<()> {
        if !record.value.matches(record.datatype) {
            return Err(GatewayError::TypeMismatch(format!(
                "tag {} declares {:?} but carries {:?}",
                record.id,
                record.datatype,
                record.value.datatype()
            )));
        }
        if record.quality == Quality::Uninitialized && record.last_update_ns != 0 {
            return Err(GatewayError::InvalidArgument(format!(
                "tag {} is uninitialized but has a read timestamp",
                record.id
            )));
        }
        match self.tags.entry(record.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(GatewayError::AlreadyExists(record.id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Snapshot of one record.
    pub fn get(&self, id: &str) -> Result<TagRecord> {
        self.tags
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tags.contains_key(id)
    }

    /// Poller-side update: coerces the raw driver value to the stored
    /// datatype and stamps quality and timestamp together.
    pub fn update_value(
        &self,
        id: &str,
        raw: &TagValue,
        quality: Quality,
        ts_ns: u64,
    ) -> Result<()> {
        let mut record = self
            .tags
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        let coerced = TagValue::coerce(raw, &record)?;
        record.value = coerced;
        record.quality = quality;
        record.last_update_ns = ts_ns;
        Ok(())
    }

    /// Mark the value's freshness without replacing it, e.g. `Stale` when
    /// the owning PLC faults or `Bad` when one address fails in a batch.
    pub fn mark_quality(&self, id: &str, quality: Quality) -> Result<()> {
        let mut record = self
            .tags
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        // Never resurrect a tag that has no value yet.
        if record.quality != Quality::Uninitialized {
            record.quality = quality;
        }
        Ok(())
    }

    /// Partial update from REST/OPC UA. A new value must match the declared
    /// datatype exactly (no coercion at the API boundary).
    pub fn patch(&self, id: &str, patch: TagPatch) -> Result<TagRecord> {
        let mut record = self
            .tags
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        if let Some(value) = patch.value {
            if !value.matches(record.datatype) {
                return Err(GatewayError::TypeMismatch(format!(
                    "tag {} declares {:?} but patch carries {:?}",
                    id,
                    record.datatype,
                    value.datatype()
                )));
            }
            record.value = value;
        }
        if let Some(writable) = patch.writable {
            record.writable = writable;
        }
        Ok(record.clone())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.tags
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    pub fn clear(&self) {
        self.tags.clear();
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Consistent per-record view of all tags; no torn record ever appears.
    pub fn snapshot(&self) -> Vec<TagRecord> {
        self.tags.iter().map(|e| e.value().clone()).collect()
    }

    pub fn snapshot_by_plc(&self, plc: PlcName) -> Vec<TagRecord> {
        self.tags
            .iter()
            .filter(|e| e.plc == plc)
            .map(|e| e.value().clone())
            .collect()
    }

    /// The `(id, address)` pairs a poller should read this cycle.
    pub fn subscribed(&self, plc: PlcName) -> Vec<(String, String)> {
        self.tags
            .iter()
            .filter(|e| e.plc == plc && e.enabled && !e.address.is_empty())
            .map(|e| (e.id.clone(), e.address.clone()))
            .collect()
    }

    /// Resolve a tag id by its owning PLC and driver address.
    pub fn find_by_address(&self, plc: PlcName, address: &str) -> Option<String> {
        self.tags
            .iter()
            .find(|e| e.plc == plc && e.address == address)
            .map(|e| e.key().clone())
    }
}
