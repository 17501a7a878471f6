//! The reconstructed directory tree.
//!
//! Items live in one growable vector per depth level and are addressed by
//! `(level, index)`, so appending children never invalidates an `ItemId`
//! held elsewhere. A parent's children occupy a contiguous range of the next
//! level.

use log::{debug, trace, warn};
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{DirTreeError, Result};
use crate::record::{FileNameRecord, ROOT_RECORD, RecordReference};
use crate::scan::ScanContext;
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ItemId {
    pub level: usize,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheItem {
    /// Index of the parent in the previous level. `None` for the root.
    pub parent: Option<usize>,
    pub level: usize,
    pub reference: RecordReference,
    /// For directories `real_size` is overwritten with the subtree total.
    pub name: FileNameRecord,
    pub first_child: usize,
    pub child_count: usize,
}

impl CacheItem {
    pub fn is_directory(&self) -> bool {
        self.name.is_directory()
    }

    pub fn size(&self) -> u64 {
        self.name.real_size
    }
}

#[derive(Debug, Default)]
pub struct LeveledCache {
    levels: Vec<Vec<CacheItem>>,
}

impl LeveledCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a tree. Any previous content is dropped.
    pub fn set_root(&mut self, reference: RecordReference, name: FileNameRecord) -> ItemId {
        self.levels.clear();
        self.levels.push(vec![CacheItem {
            parent: None,
            level: 0,
            reference,
            name,
            first_child: 0,
            child_count: 0,
        }]);
        ItemId { level: 0, index: 0 }
    }

    /// Append a child of `parent`. Children of one parent must be pushed
    /// back to back.
    pub fn push_child(
        &mut self,
        parent: ItemId,
        reference: RecordReference,
        name: FileNameRecord,
    ) -> Result<ItemId> {
        let level = parent.level + 1;
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
        let index = self.levels[level].len();

        let owner = self
            .levels
            .get_mut(parent.level)
            .and_then(|l| l.get_mut(parent.index))
            .ok_or_else(|| DirTreeError::Consistency(format!("no tree item {parent:?}")))?;
        if owner.child_count == 0 {
            owner.first_child = index;
        } else if owner.first_child + owner.child_count != index {
            return Err(DirTreeError::Consistency(format!(
                "children of {parent:?} are not contiguous"
            )));
        }
        owner.child_count += 1;

        self.levels[level].push(CacheItem {
            parent: Some(parent.index),
            level,
            reference,
            name,
            first_child: 0,
            child_count: 0,
        });
        Ok(ItemId { level, index })
    }

    pub fn get(&self, id: ItemId) -> Option<&CacheItem> {
        self.levels.get(id.level)?.get(id.index)
    }

    fn set_size(&mut self, id: ItemId, size: u64) {
        if let Some(item) = self.levels.get_mut(id.level).and_then(|l| l.get_mut(id.index)) {
            item.name.real_size = size;
        }
    }

    pub fn root(&self) -> Option<&CacheItem> {
        self.get(ItemId { level: 0, index: 0 })
    }

    pub fn level(&self, level: usize) -> &[CacheItem] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or_default()
    }

    /// Number of levels, the root's included.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Level by level, each level in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ItemId, &CacheItem)> {
        self.levels.iter().enumerate().flat_map(|(level, items)| {
            items
                .iter()
                .enumerate()
                .map(move |(index, item)| (ItemId { level, index }, item))
        })
    }

    pub fn children(&self, id: ItemId) -> impl Iterator<Item = (ItemId, &CacheItem)> {
        let (first, count) = self
            .get(id)
            .map(|i| (i.first_child, i.child_count))
            .unwrap_or((0, 0));
        let level = id.level + 1;
        self.level(level)
            .iter()
            .enumerate()
            .skip(first)
            .take(count)
            .map(move |(index, item)| (ItemId { level, index }, item))
    }

    /// Depth-first order, children in collation order.
    pub fn depth_first(&self) -> Vec<ItemId> {
        let mut out = Vec::with_capacity(self.len());
        let mut stack = Vec::new();
        if self.root().is_some() {
            stack.push(ItemId { level: 0, index: 0 });
        }
        while let Some(id) = stack.pop() {
            out.push(id);
            let children: Vec<ItemId> = self.children(id).map(|(c, _)| c).collect();
            stack.extend(children.into_iter().rev());
        }
        out
    }

    /// `/`-separated path from the root, which itself is `/`.
    pub fn path_of(&self, id: ItemId) -> String {
        let mut parts = Vec::new();
        let mut current = self.get(id).map(|item| (id.level, item));
        while let Some((level, item)) = current {
            let Some(parent) = item.parent else { break };
            parts.push(item.name.name.as_str());
            current = level
                .checked_sub(1)
                .and_then(|l| self.levels.get(l)?.get(parent).map(|p| (l, p)));
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    pub fn to_json(&self) -> Value {
        json!(
            self.depth_first()
                .into_iter()
                .filter_map(|id| self.get(id).map(|item| (id, item)))
                .map(|(id, item)| json!({
                    "path": self.path_of(id),
                    "level": item.level,
                    "record": item.reference.to_string(),
                    "directory": item.is_directory(),
                    "size": item.size(),
                    "modified": crate::record::filetime_to_rfc3339(item.name.modified),
                }))
                .collect::<Vec<Value>>()
        )
    }
}

fn is_metafile(name: &FileNameRecord) -> bool {
    name.parent.index == ROOT_RECORD && name.name.starts_with('$')
}

/// Sizes come from disk; a sum past `u64::MAX` sticks there.
fn add_size(total: u64, size: u64, tree: &LeveledCache, id: ItemId) -> u64 {
    total.checked_add(size).unwrap_or_else(|| {
        warn!("Size total overflows at {}, saturating", tree.path_of(id));
        u64::MAX
    })
}

/// Fill the level below `parent` from its index and recurse into every
/// subdirectory. Returns the total size of the subtree.
pub(crate) fn enumerate_into<V: Volume>(
    ctx: &mut ScanContext<V>,
    tree: &mut LeveledCache,
    parent: ItemId,
    depth: usize,
) -> Result<u64> {
    let max_depth = ctx.config().max_depth;
    if depth > max_depth {
        return Err(DirTreeError::DepthExceeded(max_depth));
    }
    let parent_ref = tree
        .get(parent)
        .map(|item| item.reference)
        .ok_or_else(|| DirTreeError::Consistency(format!("no tree item {parent:?}")))?;

    let listing = ctx.list_directory(parent_ref)?;
    let skip_metafiles = ctx.config().skip_metafiles;

    let mut accepted = Vec::with_capacity(listing.entries.len());
    for (reference, name) in listing.entries {
        if name.name == "." || reference.slot() == parent_ref.slot() {
            continue;
        }
        if skip_metafiles && is_metafile(&name) {
            trace!("Skipping metafile {}", name.name);
            continue;
        }
        accepted.push(tree.push_child(parent, reference, name)?);
    }

    let mut total = 0u64;
    for id in accepted {
        let Some(item) = tree.get(id) else { continue };
        let (is_dir, is_reparse, size) = (
            item.is_directory(),
            item.name.is_reparse_point(),
            item.size(),
        );
        if !is_dir {
            ctx.stats.files += 1;
            total = add_size(total, size, tree, id);
            continue;
        }
        ctx.stats.directories += 1;
        if is_reparse {
            debug!("Not following reparse point {}", tree.path_of(id));
            continue;
        }
        match enumerate_into(ctx, tree, id, depth + 1) {
            Ok(subtree) => total = add_size(total, subtree, tree, id),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Skipping {}: {e}", tree.path_of(id));
                ctx.stats.skipped += 1;
            }
        }
    }
    tree.set_size(parent, total);
    Ok(total)
}
