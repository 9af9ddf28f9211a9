//! Arena of partial mapping records, indexed by byte range and by address.

use std::collections::{BTreeMap, HashMap};

use crate::mmap::{MapAddr, MapRecord};

/// Stable handle to a record slot inside a [`RegionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RecordId(usize);

/// Owns every partial mapping of one file exactly once.
///
/// `by_range` and `by_addr` always index the same set of live records; a
/// record leaves both indices in the same call that frees its slot.
#[derive(Debug, Default)]
pub(crate) struct RegionTable {
    slots: Vec<Option<MapRecord>>,
    free: Vec<usize>,
    by_range: BTreeMap<(u64, u64), RecordId>,
    by_addr: HashMap<MapAddr, RecordId>,
}

impl RegionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    pub(crate) fn len(&self) -> usize {
        self.by_range.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_range.is_empty()
    }

    pub(crate) fn find_range(&self, offset: u64, len: u64) -> Option<RecordId> {
        self.by_range.get(&(offset, len)).copied()
    }

    pub(crate) fn find_addr(&self, addr: MapAddr) -> Option<RecordId> {
        self.by_addr.get(&addr).copied()
    }

    pub(crate) fn get(&self, id: RecordId) -> Option<&MapRecord> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: RecordId) -> Option<&mut MapRecord> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Store `record` and index it under its range and address.
    pub(crate) fn insert(&mut self, record: MapRecord) -> RecordId {
        let range = (record.offset, record.len);
        let addr = record.addr();
        let id = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(record);
                RecordId(slot)
            }
            None => {
                self.slots.push(Some(record));
                RecordId(self.slots.len() - 1)
            }
        };
        self.by_range.insert(range, id);
        self.by_addr.insert(addr, id);
        id
    }

    /// Unindex and hand back the record; dropping it unmaps the memory.
    pub(crate) fn remove(&mut self, id: RecordId) -> Option<MapRecord> {
        let record = self.slots.get_mut(id.0)?.take()?;
        self.by_range.remove(&(record.offset, record.len));
        self.by_addr.remove(&record.addr());
        self.free.push(id.0);
        Some(record)
    }

    /// Records in ascending (offset, len) order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &MapRecord> + '_ {
        self.by_range.values().filter_map(move |id| self.get(*id))
    }

    /// Mutable access to every live record, in slot order.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut MapRecord> + '_ {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }
}
