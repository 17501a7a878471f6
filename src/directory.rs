//! Per-directory view of the $I30 index: root value, allocation runs,
//! allocation bitmap and the INDX blocks loaded from them.

use log::{debug, trace, warn};
use std::rc::Rc;

use crate::attribute::{Located, read_value, resolve};
use crate::bitmap::Bitmap;
use crate::cache::RecordCache;
use crate::config::AllocScanMode;
use crate::error::{DirTreeError, Result};
use crate::fixup::{BlockState, apply_fixups, fixup_blocks};
use crate::index::{INDX_MAGIC, IndexBlocks, IndexNode, IndexRoot, Listing, lookup, scan_blocks, walk};
use crate::record::{AttributeType, FileNameRecord, MftRecord, RecordReference};
use crate::runs::{DataRun, total_clusters, vcn_to_lcn};
use crate::volume::{Volume, read_stream};

pub const I30: &str = "$I30";

/// Subnode VCNs count clusters, or 512-byte units when index blocks are
/// smaller than a cluster.
const SMALL_BLOCK_VCN_UNIT: u32 = 512;

#[derive(Debug)]
pub struct DirectoryNode {
    pub reference: RecordReference,
    pub root: IndexRoot,
    root_value: Vec<u8>,
    pub alloc_runs: Vec<DataRun>,
    pub bitmap: Bitmap,
    pub blocks: IndexBlocks,
    pub cluster_reads: u64,
    bytes_per_cluster: u32,
    bytes_per_sector: u32,
}

fn is_i30(located: &Located) -> bool {
    located.attribute.header().name.as_deref() == Some(I30)
}

impl DirectoryNode {
    /// Gather the index attributes of `record`. No INDX block is read yet.
    pub fn open<V: Volume + ?Sized>(
        volume: &mut V,
        cache: &mut RecordCache,
        record: &Rc<MftRecord>,
        max_fragments: usize,
    ) -> Result<Self> {
        let reference = record.reference;

        let root_attr = resolve(volume, cache, record, AttributeType::IndexRoot, max_fragments)?
            .into_iter()
            .find(is_i30)
            .ok_or_else(|| DirTreeError::NotFound(format!("record {reference} has no $I30 index")))?;
        if !root_attr.is_resident() {
            return Err(DirTreeError::Corruption(format!(
                "record {reference}: index root is non-resident"
            )));
        }
        let root_value = root_attr.value()?.to_vec();
        let root = IndexRoot::from_bytes(&root_value)?;

        let mut alloc_runs = Vec::new();
        for fragment in resolve(volume, cache, record, AttributeType::IndexAllocation, max_fragments)?
            .iter()
            .filter(|l| is_i30(l))
        {
            match fragment.data_runs() {
                Ok(runs) => alloc_runs.extend(runs),
                Err(e) => warn!("Record {reference}: index allocation runs unusable: {e}"),
            }
        }
        alloc_runs.sort_by_key(|r| r.vcn);
        for pair in alloc_runs.windows(2) {
            if pair[0].end_vcn() != pair[1].vcn {
                warn!(
                    "Record {reference}: index allocation has a gap or overlap at VCN {}",
                    pair[1].vcn
                );
            }
        }

        let bpc = volume.geometry().bytes_per_cluster as u64;
        let volume_bytes = volume.geometry().total_clusters.saturating_mul(bpc);
        let span = match (alloc_runs.first(), alloc_runs.iter().map(DataRun::end_vcn).max()) {
            (Some(first), Some(end)) => (end - first.vcn).max(total_clusters(&alloc_runs)),
            _ => 0,
        };
        let alloc_bytes = span
            .checked_mul(bpc)
            .filter(|&bytes| bytes <= volume_bytes)
            .ok_or_else(|| {
                DirTreeError::Corruption(format!(
                    "record {reference}: index allocation of {span} clusters exceeds the volume"
                ))
            })?;

        let bitmap = match resolve(volume, cache, record, AttributeType::Bitmap, max_fragments)?
            .into_iter()
            .find(is_i30)
        {
            Some(located) => Bitmap::new(read_value(volume, &located)?),
            None if !alloc_runs.is_empty() => {
                warn!("Record {reference}: index allocation without a bitmap, trusting every block");
                let blocks = alloc_bytes / root.block_size.max(1) as u64;
                Bitmap::new(vec![0xFF; blocks.div_ceil(8) as usize])
            }
            None => Bitmap::default(),
        };

        let geometry = volume.geometry();
        Ok(Self {
            reference,
            root,
            root_value,
            alloc_runs,
            bitmap,
            blocks: IndexBlocks::new(),
            cluster_reads: 0,
            bytes_per_cluster: geometry.bytes_per_cluster,
            bytes_per_sector: geometry.bytes_per_sector,
        })
    }

    pub fn root_node(&self) -> Result<IndexNode<'_>> {
        IndexNode::root(&self.root_value)
    }

    pub fn has_allocation(&self) -> bool {
        !self.alloc_runs.is_empty()
    }

    fn block_size(&self) -> u64 {
        self.root.block_size as u64
    }

    fn vcn_unit(&self) -> u64 {
        if self.root.block_size >= self.bytes_per_cluster {
            self.bytes_per_cluster as u64
        } else {
            SMALL_BLOCK_VCN_UNIT as u64
        }
    }

    /// Read, fix up and register every in-use INDX block up to the highest
    /// bit set in the bitmap.
    pub fn preload<V: Volume + ?Sized>(&mut self, volume: &mut V) -> Result<()> {
        if self.alloc_runs.is_empty() {
            return Ok(());
        }
        let Some(highest) = self.bitmap.highest_set() else {
            debug!("Directory {}: no index block in use", self.reference);
            return Ok(());
        };
        let block_size = self.block_size();
        if block_size == 0 || block_size % self.bytes_per_sector as u64 != 0 {
            return Err(DirTreeError::Corruption(format!(
                "directory {}: index block size {}",
                self.reference, block_size
            )));
        }

        let bpc = self.bytes_per_cluster as u64;
        let base_vcn = self.alloc_runs[0].vcn;
        let alloc_end = self
            .alloc_runs
            .iter()
            .map(DataRun::end_vcn)
            .max()
            .unwrap_or(base_vcn);
        let alloc_bytes = (alloc_end - base_vcn).checked_mul(bpc).ok_or_else(|| {
            DirTreeError::Corruption(format!(
                "directory {}: index allocation ends at VCN {alloc_end}",
                self.reference
            ))
        })?;
        let mut needed_bytes = highest
            .checked_add(1)
            .and_then(|blocks| blocks.checked_mul(block_size))
            .ok_or_else(|| {
                DirTreeError::Corruption(format!(
                    "directory {}: bitmap bit {highest} is out of reach",
                    self.reference
                ))
            })?;
        if needed_bytes > alloc_bytes {
            warn!(
                "Directory {}: bitmap marks block {} but allocation ends at byte {}",
                self.reference, highest, alloc_bytes
            );
            needed_bytes = alloc_bytes - alloc_bytes % block_size;
        }
        if needed_bytes == 0 {
            return Ok(());
        }
        let needed_end = base_vcn + needed_bytes.div_ceil(bpc);

        let mut stream = Vec::with_capacity(needed_bytes as usize);
        for run in &self.alloc_runs {
            if run.vcn >= needed_end {
                break;
            }
            let at = ((run.vcn - base_vcn) * bpc) as usize;
            if stream.len() < at {
                stream.resize(at, 0);
            }
            let count = run.length.min(needed_end - run.vcn);
            match run.lcn {
                Some(lcn) => {
                    self.cluster_reads += 1;
                    match volume.read_clusters(lcn, count) {
                        Ok(bytes) => stream.extend_from_slice(&bytes),
                        Err(e) => {
                            warn!(
                                "Directory {}: cannot read index clusters {lcn}+{count}: {e}",
                                self.reference
                            );
                            stream.resize(stream.len() + (count * bpc) as usize, 0);
                        }
                    }
                }
                None => stream.resize(stream.len() + (count * bpc) as usize, 0),
            }
        }
        stream.resize(needed_bytes as usize, 0);

        let states = fixup_blocks(
            &mut stream,
            block_size as usize,
            self.bytes_per_sector as usize,
            INDX_MAGIC,
        )?;
        let vcns_per_block = block_size / self.vcn_unit();

        for (i, (state, raw)) in states
            .iter()
            .zip(stream.chunks_exact(block_size as usize))
            .enumerate()
        {
            let i = i as u64;
            if !self.bitmap.get(i) {
                trace!("Directory {}: block {i} not in use", self.reference);
                continue;
            }
            match state {
                BlockState::Fixed => {
                    let vcn = base_vcn * bpc / self.vcn_unit() + i * vcns_per_block;
                    let lcn = vcn_to_lcn(&self.alloc_runs, base_vcn + i * block_size / bpc);
                    self.blocks.insert(vcn, lcn, raw.to_vec());
                }
                BlockState::Unsigned if raw.iter().all(|&b| b == 0) => {
                    debug!("Directory {}: block {i} is zero filled, skipped", self.reference);
                }
                BlockState::Unsigned => {
                    warn!("Directory {}: block {i} has no INDX signature, skipped", self.reference);
                }
                BlockState::Torn => {
                    warn!("Directory {}: block {i} failed fixup, skipped", self.reference);
                }
            }
        }
        debug!(
            "Directory {}: {} of {} index blocks loaded",
            self.reference,
            self.blocks.len(),
            self.bitmap.count_set()
        );
        Ok(())
    }

    /// Children in collation order. `mode` decides whether the loaded blocks
    /// are also scanned outside the tree walk.
    pub fn children(&self, mode: AllocScanMode) -> Result<Listing> {
        let mut listing = walk(&self.root_node()?, &self.blocks);
        let flat = match mode {
            AllocScanMode::Never => false,
            AllocScanMode::Always => self.has_allocation(),
            AllocScanMode::Fallback => listing.missing_subnodes > 0 && !self.blocks.is_empty(),
        };
        if flat {
            debug!(
                "Directory {}: scanning {} index blocks directly",
                self.reference,
                self.blocks.len()
            );
            listing.merge(scan_blocks(&self.blocks));
            listing.sort();
        }
        Ok(listing)
    }

    /// Point lookup of one child by name, reading INDX blocks on demand.
    pub fn find<V: Volume + ?Sized>(
        &self,
        volume: &mut V,
        name: &str,
    ) -> Result<Option<(RecordReference, FileNameRecord)>> {
        let block_size = self.block_size() as usize;
        let unit = self.vcn_unit();
        let sector = self.bytes_per_sector as usize;
        let runs = &self.alloc_runs;
        let mut fetch = |vcn: u64| -> Result<Vec<u8>> {
            if let Some(raw) = self.blocks.get(vcn) {
                return Ok(raw.to_vec());
            }
            let mut raw = read_stream(volume, runs, vcn * unit, block_size)?;
            apply_fixups(&mut raw, sector)?;
            Ok(raw)
        };
        lookup(&self.root_node()?, name, &mut fetch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FileNamespace, RecordReference};
    use crate::testutil::{
        CLUSTER, MemoryVolume, RecordBuilder, dir_entry, encode_runs, end_entry, file_entry,
        index_root_value, indx_block, with_subnode,
    };

    fn open(vol: &mut MemoryVolume, index: u32) -> DirectoryNode {
        let mut cache = RecordCache::new();
        let rec = cache
            .load_cached(vol, RecordReference::new(index, 1))
            .unwrap();
        DirectoryNode::open(vol, &mut cache, &rec, 5).unwrap()
    }

    fn names(listing: &Listing) -> Vec<String> {
        listing.entries.iter().map(|(_, n)| n.name.clone()).collect()
    }

    /// Directory 90: root points at two blocks at LCN 400/401 (VCN 0/1),
    /// plus a third block at LCN 402 only reachable by a flat scan.
    fn large_directory(vol: &mut MemoryVolume, bitmap: u8) {
        vol.put_record(
            RecordBuilder::new(90)
                .directory()
                .resident(
                    AttributeType::IndexRoot,
                    Some(I30),
                    &index_root_value(
                        &[with_subnode(dir_entry(91, 90, "m"), 0), end_entry(Some(1))],
                        true,
                    ),
                )
                .non_resident(
                    AttributeType::IndexAllocation,
                    Some(I30),
                    0,
                    3,
                    &encode_runs(&[(Some(400), 3), (Some(700), 1)]),
                    4 * CLUSTER as u64,
                )
                .resident(AttributeType::Bitmap, Some(I30), &[bitmap])
                .build(),
        );
        vol.put_cluster(400, indx_block(0, &[dir_entry(92, 90, "c"), end_entry(None)], false));
        vol.put_cluster(401, indx_block(1, &[dir_entry(93, 90, "x"), end_entry(None)], false));
        vol.put_cluster(402, indx_block(2, &[dir_entry(94, 90, "orphan"), end_entry(None)], false));
    }

    #[test]
    fn root_only_directory_reads_no_clusters() {
        let mut vol = MemoryVolume::new();
        vol.put_record(
            RecordBuilder::new(95)
                .directory()
                .resident(
                    AttributeType::IndexRoot,
                    Some(I30),
                    &index_root_value(
                        &[
                            file_entry(97, 95, "second.txt", FileNamespace::Win32, 0, 7),
                            file_entry(96, 95, "First.txt", FileNamespace::Win32, 0, 3),
                            end_entry(None),
                        ],
                        false,
                    ),
                )
                .build(),
        );
        let mut dir = open(&mut vol, 95);
        dir.preload(&mut vol).unwrap();
        let listing = dir.children(AllocScanMode::Always).unwrap();

        assert_eq!(names(&listing), vec!["First.txt", "second.txt"]);
        assert_eq!(vol.cluster_reads(), 0);
        assert_eq!(dir.cluster_reads, 0);
    }

    #[test]
    fn empty_bitmap_skips_preload() {
        let mut vol = MemoryVolume::new();
        large_directory(&mut vol, 0x00);
        let mut dir = open(&mut vol, 90);
        dir.preload(&mut vol).unwrap();

        assert!(dir.blocks.is_empty());
        assert_eq!(vol.cluster_reads(), 0);
        let listing = dir.children(AllocScanMode::Fallback).unwrap();
        assert_eq!(names(&listing), vec!["m"]);
        assert_eq!(listing.missing_subnodes, 2);
    }

    #[test]
    fn preload_reads_up_to_the_highest_set_bit() {
        let mut vol = MemoryVolume::new();
        large_directory(&mut vol, 0b0000_0011);
        let mut dir = open(&mut vol, 90);
        dir.preload(&mut vol).unwrap();

        assert_eq!(dir.blocks.len(), 2);
        assert!(dir.blocks.get_by_lcn(401).is_some());
        // Only the first run, and only two of its three clusters.
        assert_eq!(vol.cluster_reads(), 1);

        let listing = dir.children(AllocScanMode::Fallback).unwrap();
        assert_eq!(names(&listing), vec!["c", "m", "x"]);
    }

    #[test]
    fn flat_scan_recovers_unreachable_blocks() {
        let mut vol = MemoryVolume::new();
        large_directory(&mut vol, 0b0000_0111);
        let mut dir = open(&mut vol, 90);
        dir.preload(&mut vol).unwrap();
        assert_eq!(dir.blocks.len(), 3);

        assert_eq!(
            names(&dir.children(AllocScanMode::Never).unwrap()),
            vec!["c", "m", "x"]
        );
        assert_eq!(
            names(&dir.children(AllocScanMode::Always).unwrap()),
            vec!["c", "m", "orphan", "x"]
        );
    }

    #[test]
    fn cleared_bits_and_zero_blocks_are_not_registered() {
        let mut vol = MemoryVolume::new();
        large_directory(&mut vol, 0b0000_1101);
        let mut dir = open(&mut vol, 90);
        dir.preload(&mut vol).unwrap();

        // Block 1 is not in use, block 3 (LCN 700) is all zeros.
        assert!(dir.blocks.get(0).is_some());
        assert!(dir.blocks.get(1).is_none());
        assert!(dir.blocks.get(2).is_some());
        assert!(dir.blocks.get(3).is_none());
        assert_eq!(vol.cluster_reads(), 2);

        let listing = dir.children(AllocScanMode::Fallback).unwrap();
        assert_eq!(names(&listing), vec!["c", "m", "orphan"]);
    }

    #[test]
    fn bitmap_past_the_allocation_is_cut_short() {
        let mut vol = MemoryVolume::new();
        large_directory(&mut vol, 0xFF);
        let mut dir = open(&mut vol, 90);
        dir.preload(&mut vol).unwrap();

        // Bits 4..7 name blocks the four allocated clusters cannot hold.
        assert_eq!(dir.blocks.len(), 3);
        assert_eq!(vol.cluster_reads(), 2);
    }

    #[test]
    fn oversized_bitmap_is_limited_to_its_runs() {
        let mut vol = MemoryVolume::new();
        vol.put_record(
            RecordBuilder::new(95)
                .directory()
                .resident(
                    AttributeType::IndexRoot,
                    Some(I30),
                    &index_root_value(&[end_entry(Some(0))], true),
                )
                .non_resident(
                    AttributeType::IndexAllocation,
                    Some(I30),
                    0,
                    0,
                    &encode_runs(&[(Some(500), 1)]),
                    CLUSTER as u64,
                )
                .non_resident(
                    AttributeType::Bitmap,
                    Some(I30),
                    0,
                    0,
                    &encode_runs(&[(Some(600), 1)]),
                    u64::MAX,
                )
                .build(),
        );
        vol.put_cluster(500, indx_block(0, &[dir_entry(96, 95, "y"), end_entry(None)], false));
        let mut bitmap = vec![0u8; CLUSTER];
        bitmap[0] = 0x01;
        vol.put_cluster(600, bitmap);

        let mut dir = open(&mut vol, 95);
        assert_eq!(dir.bitmap.highest_set(), Some(0));
        dir.preload(&mut vol).unwrap();
        let listing = dir.children(AllocScanMode::Fallback).unwrap();
        assert_eq!(names(&listing), vec!["y"]);
    }

    #[test]
    fn allocation_larger_than_the_volume_is_corrupt() {
        let mut vol = MemoryVolume::new();
        let clusters = u32::MAX as u64;
        vol.put_record(
            RecordBuilder::new(97)
                .directory()
                .resident(
                    AttributeType::IndexRoot,
                    Some(I30),
                    &index_root_value(&[end_entry(Some(0))], true),
                )
                .non_resident(
                    AttributeType::IndexAllocation,
                    Some(I30),
                    0,
                    clusters - 1,
                    &encode_runs(&[(Some(500), clusters)]),
                    clusters * CLUSTER as u64,
                )
                .build(),
        );
        let mut cache = RecordCache::new();
        let rec = cache
            .load_cached(&mut vol, RecordReference::new(97, 1))
            .unwrap();
        let err = DirectoryNode::open(&mut vol, &mut cache, &rec, 5).unwrap_err();
        assert!(matches!(err, DirTreeError::Corruption(_)));
        assert_eq!(vol.cluster_reads(), 0);
    }

    #[test]
    fn find_reads_blocks_on_demand() {
        let mut vol = MemoryVolume::new();
        large_directory(&mut vol, 0b0000_0011);
        let dir = open(&mut vol, 90);
        let before = vol.cluster_reads();

        let (reference, name) = dir.find(&mut vol, "X").unwrap().unwrap();
        assert_eq!(reference.index, 93);
        assert_eq!(name.name, "x");
        assert_eq!(vol.cluster_reads(), before + 1);
        assert!(dir.find(&mut vol, "nothing").unwrap().is_none());
    }

    #[test]
    fn directory_without_index_is_not_found() {
        let mut vol = MemoryVolume::new();
        vol.put_record(RecordBuilder::new(98).build());
        let mut cache = RecordCache::new();
        let rec = cache
            .load_cached(&mut vol, RecordReference::new(98, 1))
            .unwrap();
        let err = DirectoryNode::open(&mut vol, &mut cache, &rec, 5).unwrap_err();
        assert!(err.is_not_found());
    }
}
