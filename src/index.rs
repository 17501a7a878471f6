//! Directory index ($I30) structures and the B-tree walk over them.
//!
//! A node is never materialised beyond its `IndexHeader` and the raw bytes
//! that hold it: the resident $INDEX_ROOT value, or one fixed-up INDX block
//! of the $INDEX_ALLOCATION stream.

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, trace, warn};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Cursor, Seek, SeekFrom};

use crate::bytes::ByteView;
use crate::error::{DirTreeError, Result};
use crate::record::{FileNameRecord, RecordReference};

pub const INDX_MAGIC: &[u8; 4] = b"INDX";

pub const ENTRY_HAS_SUBNODE: u32 = 0x01;
pub const ENTRY_LAST: u32 = 0x02;

/// Reference + length + key length + flags.
pub const MIN_ENTRY_SIZE: usize = 0x10;

/// Offset of the node header inside an INDX block.
const BLOCK_HEADER_OFFSET: usize = 0x18;
/// Offset of the node header inside an $INDEX_ROOT value.
const ROOT_HEADER_OFFSET: usize = 0x10;

/// Case-insensitive ordering of file names, as used by the $I30 collation.
pub fn collate(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_uppercase)
        .cmp(b.chars().flat_map(char::to_uppercase))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub entries_offset: u32,
    pub used: u32,
    pub allocated: u32,
    pub flags: u8,
}

impl IndexHeader {
    pub const SIZE: usize = 0x10;

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < Self::SIZE {
            return Err(DirTreeError::Corruption(format!(
                "index header needs {} bytes, got {}",
                Self::SIZE,
                raw.len()
            )));
        }
        let mut cur = Cursor::new(raw);
        let entries_offset = cur.read_u32::<LittleEndian>()?;
        let used = cur.read_u32::<LittleEndian>()?;
        let allocated = cur.read_u32::<LittleEndian>()?;
        let flags = cur.read_u8()?;
        Ok(Self {
            entries_offset,
            used,
            allocated,
            flags,
        })
    }

    /// Set when the index has nodes in $INDEX_ALLOCATION.
    pub fn is_large(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// Fixed part of an $INDEX_ROOT value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRoot {
    pub indexed_type: u32,
    pub collation_rule: u32,
    pub block_size: u32,
    pub clusters_per_block: u8,
    pub header: IndexHeader,
}

impl IndexRoot {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < ROOT_HEADER_OFFSET + IndexHeader::SIZE {
            return Err(DirTreeError::Corruption(format!(
                "index root value of {} bytes",
                raw.len()
            )));
        }
        let mut cur = Cursor::new(raw);
        let indexed_type = cur.read_u32::<LittleEndian>()?;
        let collation_rule = cur.read_u32::<LittleEndian>()?;
        let block_size = cur.read_u32::<LittleEndian>()?;
        let clusters_per_block = cur.read_u8()?;
        cur.seek(SeekFrom::Current(3))?;
        Ok(Self {
            indexed_type,
            collation_rule,
            block_size,
            clusters_per_block,
            header: IndexHeader::from_bytes(&raw[ROOT_HEADER_OFFSET..])?,
        })
    }
}

/// One B-tree slot.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub reference: RecordReference,
    pub length: u16,
    pub key_length: u16,
    pub flags: u32,
    pub file_name: Option<FileNameRecord>,
    pub subnode: Option<u64>,
}

impl DirectoryEntry {
    /// Decode the entry at `offset`. A key that fails to decode is dropped
    /// with a warning; the slot itself stays usable for navigation.
    pub fn parse(view: ByteView<'_>, offset: usize) -> Result<Self> {
        let reference = RecordReference::from_u64(view.u64_at(offset)?);
        let length = view.u16_at(offset + 0x08)?;
        let key_length = view.u16_at(offset + 0x0A)?;
        let flags = view.u32_at(offset + 0x0C)?;

        if (length as usize) < MIN_ENTRY_SIZE {
            return Err(DirTreeError::Corruption(format!(
                "index entry at 0x{offset:X} claims {length} bytes"
            )));
        }
        let trailer = if flags & ENTRY_HAS_SUBNODE != 0 { 8 } else { 0 };
        if MIN_ENTRY_SIZE + key_length as usize + trailer > length as usize {
            return Err(DirTreeError::Corruption(format!(
                "index entry at 0x{offset:X}: key of {key_length} bytes does not fit in {length}"
            )));
        }
        let entry = view.sub(offset, length as usize)?;

        let file_name = if key_length > 0 {
            match FileNameRecord::parse(entry.slice(MIN_ENTRY_SIZE, key_length as usize)?) {
                Ok(name) => Some(name),
                Err(e) => {
                    warn!("Index entry for {reference}: undecodable key: {e}");
                    None
                }
            }
        } else {
            None
        };
        let subnode = if trailer > 0 {
            Some(entry.u64_at(length as usize - 8)?)
        } else {
            None
        };

        Ok(Self {
            reference,
            length,
            key_length,
            flags,
            file_name,
            subnode,
        })
    }

    pub fn is_last(&self) -> bool {
        self.flags & ENTRY_LAST != 0
    }
}

/// Raw bytes of one node plus where its header sits in them.
#[derive(Debug, Clone, Copy)]
pub struct IndexNode<'a> {
    view: ByteView<'a>,
    header_offset: usize,
    pub header: IndexHeader,
}

impl<'a> IndexNode<'a> {
    /// The node stored in an $INDEX_ROOT value.
    pub fn root(value: &'a [u8]) -> Result<Self> {
        let root = IndexRoot::from_bytes(value)?;
        Ok(Self {
            view: ByteView::new(value),
            header_offset: ROOT_HEADER_OFFSET,
            header: root.header,
        })
    }

    /// A fixed-up INDX block. Returns the node and the VCN the block
    /// claims for itself.
    pub fn block(raw: &'a [u8]) -> Result<(u64, Self)> {
        let view = ByteView::new(raw);
        if view.slice(0, 4)? != INDX_MAGIC {
            return Err(DirTreeError::Corruption(
                "index block lacks the INDX signature".to_string(),
            ));
        }
        let vcn = view.u64_at(0x10)?;
        let header = IndexHeader::from_bytes(view.tail(BLOCK_HEADER_OFFSET)?.as_slice())?;
        Ok((
            vcn,
            Self {
                view,
                header_offset: BLOCK_HEADER_OFFSET,
                header,
            },
        ))
    }

    fn first_entry(&self) -> usize {
        self.header_offset + self.header.entries_offset as usize
    }

    fn end(&self) -> usize {
        let end = self.header_offset + self.header.used as usize;
        if end > self.view.len() {
            warn!(
                "Index node claims {} used bytes, only {} present",
                self.header.used,
                self.view.len() - self.header_offset.min(self.view.len())
            );
        }
        end.min(self.view.len())
    }

    /// Entries of this node in on-disk order, stopping after the last-entry
    /// flag, at `used`, or at the first damaged entry.
    pub fn entries(&self) -> Vec<DirectoryEntry> {
        let mut out = Vec::new();
        let end = self.end();
        let mut offset = self.first_entry();

        while offset + MIN_ENTRY_SIZE <= end {
            let entry = match DirectoryEntry::parse(self.view, offset) {
                Ok(e) => e,
                Err(e) => {
                    warn!("Index node: stopping at 0x{offset:X}: {e}");
                    break;
                }
            };
            offset += entry.length as usize;
            let last = entry.is_last();
            out.push(entry);
            if last {
                break;
            }
        }
        out
    }
}

/// Loaded INDX blocks of one directory, addressed by VCN (and LCN).
#[derive(Debug, Default)]
pub struct IndexBlocks {
    by_vcn: BTreeMap<u64, Vec<u8>>,
    by_lcn: HashMap<u64, u64>,
}

impl IndexBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vcn: u64, lcn: Option<u64>, block: Vec<u8>) {
        if let Some(lcn) = lcn {
            self.by_lcn.insert(lcn, vcn);
        }
        self.by_vcn.insert(vcn, block);
    }

    pub fn get(&self, vcn: u64) -> Option<&[u8]> {
        self.by_vcn.get(&vcn).map(Vec::as_slice)
    }

    pub fn get_by_lcn(&self, lcn: u64) -> Option<&[u8]> {
        self.by_lcn.get(&lcn).and_then(|vcn| self.get(*vcn))
    }

    pub fn len(&self) -> usize {
        self.by_vcn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_vcn.is_empty()
    }

    /// Blocks in VCN order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.by_vcn.iter().map(|(vcn, b)| (*vcn, b.as_slice()))
    }
}

/// Children of a directory as found in its index.
#[derive(Debug, Default, Clone)]
pub struct Listing {
    pub entries: Vec<(RecordReference, FileNameRecord)>,
    /// Subnode pointers that could not be followed.
    pub missing_subnodes: usize,
}

impl Listing {
    fn emit(&mut self, entry: DirectoryEntry) {
        if let Some(name) = entry.file_name {
            if name.is_dos_only() {
                trace!("Skipping DOS name {} of {}", name.name, entry.reference);
            } else {
                self.entries.push((entry.reference, name));
            }
        }
    }

    /// Order entries by collated name. Stable, so equal keys keep the
    /// order they were found in.
    pub fn sort(&mut self) {
        self.entries.sort_by(|a, b| collate(&a.1.name, &b.1.name));
    }

    /// Append entries from `other` not already listed under the same
    /// record index and name.
    pub fn merge(&mut self, other: Listing) {
        let mut seen: HashSet<(u32, String)> = self
            .entries
            .iter()
            .map(|(r, n)| (r.index, n.name.clone()))
            .collect();
        let before = self.entries.len();
        self.entries.extend(
            other
                .entries
                .into_iter()
                .filter(|(r, n)| seen.insert((r.index, n.name.clone()))),
        );
        debug!("Merged {} additional entries", self.entries.len() - before);
        self.missing_subnodes += other.missing_subnodes;
    }
}

/// In-order walk of the tree rooted at `root`. Subnodes are taken from
/// `blocks`; a subnode that is not loaded, or whose block claims another
/// VCN, is counted in `missing_subnodes` and skipped.
pub fn walk(root: &IndexNode<'_>, blocks: &IndexBlocks) -> Listing {
    let mut listing = Listing::default();
    let mut visited = HashSet::new();
    walk_node(root, blocks, &mut visited, &mut listing);
    listing.sort();
    listing
}

fn walk_node(
    node: &IndexNode<'_>,
    blocks: &IndexBlocks,
    visited: &mut HashSet<u64>,
    out: &mut Listing,
) {
    for entry in node.entries() {
        if let Some(vcn) = entry.subnode {
            descend(vcn, blocks, visited, out);
        }
        out.emit(entry);
    }
}

fn descend(vcn: u64, blocks: &IndexBlocks, visited: &mut HashSet<u64>, out: &mut Listing) {
    if !visited.insert(vcn) {
        warn!("Index block at VCN {vcn} is referenced twice, not descending again");
        out.missing_subnodes += 1;
        return;
    }
    let Some(raw) = blocks.get(vcn) else {
        debug!("Subnode VCN {vcn} is not loaded");
        out.missing_subnodes += 1;
        return;
    };
    match IndexNode::block(raw) {
        Ok((stored, child)) if stored == vcn => walk_node(&child, blocks, visited, out),
        Ok((stored, _)) => {
            warn!("Index block loaded for VCN {vcn} says it is VCN {stored}");
            out.missing_subnodes += 1;
        }
        Err(e) => {
            warn!("Index block at VCN {vcn}: {e}");
            out.missing_subnodes += 1;
        }
    }
}

/// Every keyed entry of every loaded block, without following the tree.
pub fn scan_blocks(blocks: &IndexBlocks) -> Listing {
    let mut listing = Listing::default();
    for (vcn, raw) in blocks.iter() {
        match IndexNode::block(raw) {
            Ok((_, node)) => node.entries().into_iter().for_each(|e| listing.emit(e)),
            Err(e) => warn!("Index block at VCN {vcn}: {e}"),
        }
    }
    listing.sort();
    listing
}

/// Top-down search for `name`, reading only the blocks on the search path.
/// `fetch` returns the fixed-up block stored at a VCN.
pub fn lookup<F>(
    root: &IndexNode<'_>,
    name: &str,
    fetch: &mut F,
) -> Result<Option<(RecordReference, FileNameRecord)>>
where
    F: FnMut(u64) -> Result<Vec<u8>>,
{
    let mut visited = HashSet::new();
    lookup_in(root, name, fetch, &mut visited)
}

fn lookup_in<F>(
    node: &IndexNode<'_>,
    name: &str,
    fetch: &mut F,
    visited: &mut HashSet<u64>,
) -> Result<Option<(RecordReference, FileNameRecord)>>
where
    F: FnMut(u64) -> Result<Vec<u8>>,
{
    for entry in node.entries() {
        let go_down = match &entry.file_name {
            Some(key) => match collate(name, &key.name) {
                Ordering::Equal => return Ok(Some((entry.reference, key.clone()))),
                Ordering::Less => true,
                Ordering::Greater => false,
            },
            None => true,
        };
        if !go_down {
            continue;
        }
        let Some(vcn) = entry.subnode else {
            return Ok(None);
        };
        if !visited.insert(vcn) {
            return Err(DirTreeError::Corruption(format!(
                "index block at VCN {vcn} is part of a cycle"
            )));
        }
        let raw = fetch(vcn)?;
        let (stored, child) = IndexNode::block(&raw)?;
        if stored != vcn {
            return Err(DirTreeError::Corruption(format!(
                "index block read for VCN {vcn} says it is VCN {stored}"
            )));
        }
        return lookup_in(&child, name, fetch, visited);
    }
    Ok(None)
}
