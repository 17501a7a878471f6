//! Builders for synthetic NTFS structures used by the unit tests.
//!
//! Geometry: 512-byte sectors, 1 KiB clusters, 1 KiB records, 1 KiB index
//! blocks (one block per cluster).

use std::collections::HashMap;

use crate::error::{DirTreeError, Result};
use crate::fixup::protect;
use crate::record::{
    AttributeType, FILE_NAME_INDEX_PRESENT, FileNamespace, RECORD_IN_USE, RECORD_IS_DIRECTORY,
    RecordReference,
};
use crate::volume::{Volume, VolumeGeometry};

pub(crate) const SECTOR: usize = 512;
pub(crate) const CLUSTER: usize = 1024;
pub(crate) const RECORD: usize = 1024;

pub(crate) fn geometry() -> VolumeGeometry {
    VolumeGeometry {
        bytes_per_cluster: CLUSTER as u32,
        bytes_per_sector: SECTOR as u32,
        bytes_per_mft_record: RECORD as u32,
        index_block_size: CLUSTER as u32,
        total_clusters: 1 << 20,
        root_record: 5,
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn put_u16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(b: &mut [u8], off: usize, v: u64) {
    b[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn utf16(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

pub(crate) fn boot_sector(cluster_sectors: u8, record: i8, index: i8) -> Vec<u8> {
    boot_sector_with(cluster_sectors, record, index, 204_800, 4)
}

pub(crate) fn boot_sector_with(
    cluster_sectors: u8,
    record: i8,
    index: i8,
    total_sectors: u64,
    mft_cluster: u64,
) -> Vec<u8> {
    let mut b = vec![0u8; 512];
    b[0x03..0x0B].copy_from_slice(b"NTFS    ");
    put_u16(&mut b, 0x0B, 512);
    b[0x0D] = cluster_sectors;
    put_u64(&mut b, 0x28, total_sectors);
    put_u64(&mut b, 0x30, mft_cluster);
    put_u64(&mut b, 0x38, 2);
    b[0x40] = record as u8;
    b[0x44] = index as u8;
    put_u16(&mut b, 0x1FE, 0xAA55);
    b
}

/// Mapping pairs with 4-byte lengths and deltas. `None` is a sparse run.
pub(crate) fn encode_runs(runs: &[(Option<u64>, u64)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = 0i64;
    for &(lcn, len) in runs {
        match lcn {
            Some(lcn) => {
                out.push(0x44);
                out.extend((len as u32).to_le_bytes());
                out.extend(((lcn as i64 - prev) as i32).to_le_bytes());
                prev = lcn as i64;
            }
            None => {
                out.push(0x04);
                out.extend((len as u32).to_le_bytes());
            }
        }
    }
    out.push(0);
    out
}

pub(crate) fn file_name_value(
    parent: RecordReference,
    name: &str,
    namespace: FileNamespace,
    flags: u32,
    size: u64,
) -> Vec<u8> {
    let name_bytes = utf16(name);
    let mut v = vec![0u8; 0x42 + name_bytes.len()];
    put_u64(&mut v, 0x00, parent.to_u64());
    put_u64(&mut v, 0x08, 132_000_000_000_000_000);
    put_u64(&mut v, 0x28, size.div_ceil(CLUSTER as u64) * CLUSTER as u64);
    put_u64(&mut v, 0x30, size);
    put_u32(&mut v, 0x38, flags);
    v[0x40] = name.encode_utf16().count() as u8;
    v[0x41] = namespace as u8;
    v[0x42..].copy_from_slice(&name_bytes);
    v
}

pub(crate) struct RecordBuilder {
    index: u32,
    sequence: u16,
    flags: u16,
    base: RecordReference,
    attrs: Vec<Vec<u8>>,
}

impl RecordBuilder {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            sequence: 1,
            flags: RECORD_IN_USE,
            base: RecordReference::default(),
            attrs: Vec::new(),
        }
    }

    pub(crate) fn sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    pub(crate) fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn directory(mut self) -> Self {
        self.flags |= RECORD_IS_DIRECTORY;
        self
    }

    pub(crate) fn extension_of(mut self, base: RecordReference) -> Self {
        self.base = base;
        self
    }

    pub(crate) fn reference(&self) -> RecordReference {
        RecordReference::new(self.index, self.sequence)
    }

    fn attr_header(&self, buf: &mut [u8], ty: AttributeType, non_resident: bool, name: &[u8]) {
        put_u32(buf, 0x00, ty as u32);
        put_u32(buf, 0x04, buf.len() as u32);
        buf[0x08] = non_resident as u8;
        buf[0x09] = (name.len() / 2) as u8;
        put_u16(buf, 0x0E, self.attrs.len() as u16);
    }

    pub(crate) fn resident(mut self, ty: AttributeType, name: Option<&str>, value: &[u8]) -> Self {
        let name = name.map(utf16).unwrap_or_default();
        let value_off = align8(0x18 + name.len());
        let mut a = vec![0u8; align8(value_off + value.len())];
        self.attr_header(&mut a, ty, false, &name);
        put_u16(&mut a, 0x0A, 0x18);
        a[0x18..0x18 + name.len()].copy_from_slice(&name);
        put_u32(&mut a, 0x10, value.len() as u32);
        put_u16(&mut a, 0x14, value_off as u16);
        a[0x16] = (ty == AttributeType::FileName) as u8;
        a[value_off..value_off + value.len()].copy_from_slice(value);
        self.attrs.push(a);
        self
    }

    pub(crate) fn non_resident(
        mut self,
        ty: AttributeType,
        name: Option<&str>,
        start_vcn: u64,
        last_vcn: u64,
        runs: &[u8],
        real_size: u64,
    ) -> Self {
        let name = name.map(utf16).unwrap_or_default();
        let runs_off = align8(0x40 + name.len());
        let mut a = vec![0u8; align8(runs_off + runs.len())];
        self.attr_header(&mut a, ty, true, &name);
        put_u16(&mut a, 0x0A, 0x40);
        a[0x40..0x40 + name.len()].copy_from_slice(&name);
        put_u64(&mut a, 0x10, start_vcn);
        put_u64(&mut a, 0x18, last_vcn);
        put_u16(&mut a, 0x20, runs_off as u16);
        put_u64(&mut a, 0x28, (last_vcn + 1 - start_vcn) * CLUSTER as u64);
        put_u64(&mut a, 0x30, real_size);
        put_u64(&mut a, 0x38, real_size);
        a[runs_off..runs_off + runs.len()].copy_from_slice(runs);
        self.attrs.push(a);
        self
    }

    pub(crate) fn file_name(
        self,
        parent: RecordReference,
        name: &str,
        namespace: FileNamespace,
        flags: u32,
        size: u64,
    ) -> Self {
        let value = file_name_value(parent, name, namespace, flags, size);
        self.resident(AttributeType::FileName, None, &value)
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let mut b = vec![0u8; RECORD];
        b[..4].copy_from_slice(b"FILE");
        put_u16(&mut b, 0x04, 0x30);
        put_u16(&mut b, 0x06, (RECORD / SECTOR + 1) as u16);
        put_u16(&mut b, 0x10, self.sequence);
        put_u16(&mut b, 0x12, 1);
        put_u16(&mut b, 0x14, 0x38);
        put_u16(&mut b, 0x16, self.flags);
        put_u32(&mut b, 0x1C, RECORD as u32);
        put_u64(&mut b, 0x20, self.base.to_u64());
        put_u16(&mut b, 0x28, self.attrs.len() as u16);
        put_u32(&mut b, 0x2C, self.index);

        let mut pos = 0x38;
        for a in &self.attrs {
            assert!(pos + a.len() + 8 <= RECORD, "synthetic record overflows");
            b[pos..pos + a.len()].copy_from_slice(a);
            pos += a.len();
        }
        put_u32(&mut b, pos, 0xFFFF_FFFF);
        put_u32(&mut b, 0x18, (pos + 8) as u32);
        protect(&mut b, SECTOR, self.sequence.max(1)).expect("protect synthetic record");
        b
    }
}

/// One $ATTRIBUTE_LIST entry (unnamed).
pub(crate) fn list_entry(
    ty: AttributeType,
    vcn: u64,
    owner: RecordReference,
    id: u16,
) -> Vec<u8> {
    let mut e = vec![0u8; 0x20];
    put_u32(&mut e, 0x00, ty as u32);
    put_u16(&mut e, 0x04, 0x20);
    e[0x07] = 0x1A;
    put_u64(&mut e, 0x08, vcn);
    put_u64(&mut e, 0x10, owner.to_u64());
    put_u16(&mut e, 0x18, id);
    e
}

/// One index entry. `key` is a $FILE_NAME value.
pub(crate) fn index_entry(
    child: RecordReference,
    key: Option<&[u8]>,
    subnode: Option<u64>,
    last: bool,
) -> Vec<u8> {
    let key = key.unwrap_or_default();
    let mut len = align8(0x10 + key.len());
    if subnode.is_some() {
        len += 8;
    }
    let mut e = vec![0u8; len];
    put_u64(&mut e, 0x00, child.to_u64());
    put_u16(&mut e, 0x08, len as u16);
    put_u16(&mut e, 0x0A, key.len() as u16);
    let flags = subnode.is_some() as u32 | (last as u32) << 1;
    put_u32(&mut e, 0x0C, flags);
    e[0x10..0x10 + key.len()].copy_from_slice(key);
    if let Some(vcn) = subnode {
        put_u64(&mut e, len - 8, vcn);
    }
    e
}

/// Keyed entry for a child of `parent`.
pub(crate) fn file_entry(
    index: u32,
    parent: u32,
    name: &str,
    namespace: FileNamespace,
    flags: u32,
    size: u64,
) -> Vec<u8> {
    let key = file_name_value(RecordReference::new(parent, 1), name, namespace, flags, size);
    index_entry(RecordReference::new(index, 1), Some(&key), None, false)
}

pub(crate) fn dir_entry(index: u32, parent: u32, name: &str) -> Vec<u8> {
    file_entry(
        index,
        parent,
        name,
        FileNamespace::Win32,
        FILE_NAME_INDEX_PRESENT,
        0,
    )
}

/// Keyed entry that also points at a subnode.
pub(crate) fn with_subnode(entry: Vec<u8>, vcn: u64) -> Vec<u8> {
    let key_len = u16::from_le_bytes([entry[0x0A], entry[0x0B]]) as usize;
    let child = RecordReference::from_u64(u64::from_le_bytes(entry[..8].try_into().unwrap()));
    index_entry(child, Some(&entry[0x10..0x10 + key_len]), Some(vcn), false)
}

pub(crate) fn end_entry(subnode: Option<u64>) -> Vec<u8> {
    index_entry(RecordReference::default(), None, subnode, true)
}

/// $INDEX_ROOT value over `entries` (which must end with an `end_entry`).
pub(crate) fn index_root_value(entries: &[Vec<u8>], large: bool) -> Vec<u8> {
    let body: Vec<u8> = entries.concat();
    let mut v = vec![0u8; 0x20 + body.len()];
    put_u32(&mut v, 0x00, AttributeType::FileName as u32);
    put_u32(&mut v, 0x04, 1);
    put_u32(&mut v, 0x08, CLUSTER as u32);
    v[0x0C] = 1;
    put_u32(&mut v, 0x10, 0x10);
    put_u32(&mut v, 0x14, (0x10 + body.len()) as u32);
    put_u32(&mut v, 0x18, (0x10 + body.len()) as u32);
    v[0x1C] = large as u8;
    v[0x20..].copy_from_slice(&body);
    v
}

/// Protected INDX block of one cluster holding `entries`.
pub(crate) fn indx_block(vcn: u64, entries: &[Vec<u8>], has_children: bool) -> Vec<u8> {
    let body: Vec<u8> = entries.concat();
    let mut b = vec![0u8; CLUSTER];
    b[..4].copy_from_slice(b"INDX");
    put_u16(&mut b, 0x04, 0x28);
    put_u16(&mut b, 0x06, (CLUSTER / SECTOR + 1) as u16);
    put_u64(&mut b, 0x10, vcn);
    put_u32(&mut b, 0x18, 0x28);
    put_u32(&mut b, 0x1C, (0x28 + body.len()) as u32);
    put_u32(&mut b, 0x20, (CLUSTER - 0x18) as u32);
    b[0x24] = has_children as u8;
    assert!(0x40 + body.len() <= CLUSTER, "synthetic index block overflows");
    b[0x40..0x40 + body.len()].copy_from_slice(&body);
    protect(&mut b, SECTOR, 9).expect("protect synthetic index block");
    b
}

/// In-memory `Volume` with read counters.
pub(crate) struct MemoryVolume {
    geometry: VolumeGeometry,
    records: HashMap<u32, Vec<u8>>,
    clusters: HashMap<u64, Vec<u8>>,
    substitutes: HashMap<u32, u32>,
    record_reads: u64,
    cluster_reads: u64,
}

impl MemoryVolume {
    pub(crate) fn new() -> Self {
        Self {
            geometry: geometry(),
            records: HashMap::new(),
            clusters: HashMap::new(),
            substitutes: HashMap::new(),
            record_reads: 0,
            cluster_reads: 0,
        }
    }

    pub(crate) fn put_record(&mut self, raw: Vec<u8>) {
        let index = u32::from_le_bytes(raw[0x2C..0x30].try_into().unwrap());
        self.records.insert(index, raw);
    }

    /// Store `data` (a whole number of clusters) starting at `lcn`.
    pub(crate) fn put_cluster(&mut self, lcn: u64, data: Vec<u8>) {
        for (i, chunk) in data.chunks(CLUSTER).enumerate() {
            let mut c = chunk.to_vec();
            c.resize(CLUSTER, 0);
            self.clusters.insert(lcn + i as u64, c);
        }
    }

    /// Serve record `actual` whenever `requested` is fetched.
    pub(crate) fn substitute(&mut self, requested: u32, actual: u32) {
        self.substitutes.insert(requested, actual);
    }

    pub(crate) fn record_reads(&self) -> u64 {
        self.record_reads
    }

    pub(crate) fn cluster_reads(&self) -> u64 {
        self.cluster_reads
    }
}

impl Volume for MemoryVolume {
    fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    fn read_clusters(&mut self, lcn: u64, count: u64) -> Result<Vec<u8>> {
        self.cluster_reads += 1;
        let mut out = Vec::with_capacity(count as usize * CLUSTER);
        for i in 0..count {
            match self.clusters.get(&(lcn + i)) {
                Some(c) => out.extend_from_slice(c),
                None => out.extend(std::iter::repeat_n(0u8, CLUSTER)),
            }
        }
        Ok(out)
    }

    fn fetch_record(&mut self, reference: RecordReference) -> Result<Vec<u8>> {
        self.record_reads += 1;
        let index = self
            .substitutes
            .get(&reference.index)
            .copied()
            .unwrap_or(reference.index);
        self.records
            .get(&index)
            .cloned()
            .ok_or_else(|| DirTreeError::NotFound(format!("record {reference}")))
    }
}

/// Raw partition image: boot sector, $MFT at cluster 4 with one record per
/// cluster, record 0 describing the MFT itself.
pub(crate) fn build_image(records: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let mft_lcn = 4u64;
    let count = records.iter().map(|(i, _)| *i as u64 + 1).max().unwrap_or(1);
    let total_clusters = mft_lcn + count + 16;
    let mut image = vec![0u8; total_clusters as usize * CLUSTER];

    let boot = boot_sector_with(
        (CLUSTER / SECTOR) as u8,
        -10,
        1,
        total_clusters * (CLUSTER / SECTOR) as u64,
        mft_lcn,
    );
    image[..512].copy_from_slice(&boot);

    let mft = RecordBuilder::new(0)
        .non_resident(
            AttributeType::Data,
            None,
            0,
            count - 1,
            &encode_runs(&[(Some(mft_lcn), count)]),
            count * RECORD as u64,
        )
        .build();
    let mut place = |index: u64, raw: &[u8]| {
        let off = ((mft_lcn + index) as usize) * CLUSTER;
        image[off..off + raw.len()].copy_from_slice(raw);
    };
    place(0, &mft);
    for (index, raw) in records {
        place(*index as u64, raw);
    }
    image
}
