//! Scan-scoped cache of parsed MFT records and of the few raw clusters
//! (non-resident attribute lists) that are re-read during resolution.

use log::{debug, trace};
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{DirTreeError, Result};
use crate::record::{MftRecord, RecordReference};
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub record_reads: u64,
    pub cluster_reads: u64,
}

#[derive(Debug, Default)]
pub struct RecordCache {
    records: HashMap<(u32, u16), Rc<MftRecord>>,
    clusters: HashMap<(u64, u64), Rc<Vec<u8>>>,
    stats: CacheStats,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch and parse one record, bypassing the cache.
    ///
    /// The volume may substitute whatever occupies the slot for a deleted
    /// record; such a substitute, or a slot not in use, is `NotFound`.
    pub fn load<V: Volume + ?Sized>(volume: &mut V, reference: RecordReference) -> Result<MftRecord> {
        let sector = volume.geometry().bytes_per_sector as usize;
        let raw = volume.fetch_record(reference)?;
        let mut record = MftRecord::from_bytes(&raw, sector)?;

        match record.header.record_number {
            Some(self_index) if self_index != reference.index => {
                debug!(
                    "Requested record {} but the volume returned record {}",
                    reference, self_index
                );
                return Err(DirTreeError::NotFound(format!(
                    "record {reference} (slot holds record {self_index})"
                )));
            }
            Some(_) => {}
            None => debug!(
                "Record {} carries no record number, slot substitution cannot be detected",
                reference
            ),
        }
        if !record.is_in_use() {
            return Err(DirTreeError::NotFound(format!("record {reference} is not in use")));
        }
        if reference.sequence != 0 && record.header.sequence_number != reference.sequence {
            debug!(
                "Record {} has been reused (sequence {})",
                reference, record.header.sequence_number
            );
        }

        record.reference = RecordReference {
            sequence: record.header.sequence_number,
            ..reference
        };
        Ok(record)
    }

    /// `load`, memoised per record slot. Buffers stay owned by the cache.
    pub fn load_cached<V: Volume + ?Sized>(
        &mut self,
        volume: &mut V,
        reference: RecordReference,
    ) -> Result<Rc<MftRecord>> {
        if let Some(record) = self.records.get(&reference.slot()) {
            trace!("Record cache hit for {}", reference);
            self.stats.hits += 1;
            return Ok(Rc::clone(record));
        }
        self.stats.record_reads += 1;
        let record = Rc::new(Self::load(volume, reference)?);
        self.records.insert(reference.slot(), Rc::clone(&record));
        Ok(record)
    }

    /// Memoised `read_clusters`.
    pub fn load_clusters<V: Volume + ?Sized>(
        &mut self,
        volume: &mut V,
        lcn: u64,
        count: u64,
    ) -> Result<Rc<Vec<u8>>> {
        if let Some(buf) = self.clusters.get(&(lcn, count)) {
            self.stats.hits += 1;
            return Ok(Rc::clone(buf));
        }
        self.stats.cluster_reads += 1;
        let buf = Rc::new(volume.read_clusters(lcn, count)?);
        self.clusters.insert((lcn, count), Rc::clone(&buf));
        Ok(buf)
    }

    pub fn contains(&self, reference: RecordReference) -> bool {
        self.records.contains_key(&reference.slot())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Drop every cached buffer. Call between independent scans.
    pub fn reset(&mut self) {
        debug!(
            "Releasing {} cached records and {} cached cluster buffers",
            self.records.len(),
            self.clusters.len()
        );
        self.records.clear();
        self.clusters.clear();
        self.stats = CacheStats::default();
    }
}
