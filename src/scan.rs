//! One volume scan: the volume, its record cache and the configuration,
//! passed explicitly through the enumeration.

use log::{debug, info, warn};
use serde::Serialize;
use std::io::{Read, Seek};
use std::rc::Rc;

use crate::attribute::{read_value, resolve};
use crate::bytes::ByteView;
use crate::cache::RecordCache;
use crate::config::ScanConfig;
use crate::directory::DirectoryNode;
use crate::error::{DirTreeError, Result};
use crate::index::Listing;
use crate::record::{
    AttributeType, FILE_ATTRIBUTE_DIRECTORY, FILE_NAME_INDEX_PRESENT, FileNameRecord, MftRecord,
    RecordReference, VOLUME_RECORD,
};
use crate::tree::{LeveledCache, enumerate_into};
use crate::volume::{ImageVolume, Volume};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub directories: u64,
    pub files: u64,
    pub skipped: u64,
    pub records_loaded: u64,
    pub cluster_reads: u64,
}

pub struct ScanContext<V: Volume> {
    volume: V,
    cache: RecordCache,
    config: ScanConfig,
    pub(crate) stats: ScanStats,
}

impl<T: Read + Seek> ScanContext<ImageVolume<T>> {
    /// Open a raw NTFS partition image.
    pub fn open(body: T, config: ScanConfig) -> Result<Self> {
        Ok(Self::new(ImageVolume::new(body)?, config))
    }
}

impl<V: Volume> ScanContext<V> {
    pub fn new(volume: V, config: ScanConfig) -> Self {
        Self {
            volume,
            cache: RecordCache::new(),
            config: config.validated(),
            stats: ScanStats::default(),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn volume(&self) -> &V {
        &self.volume
    }

    pub fn volume_mut(&mut self) -> &mut V {
        &mut self.volume
    }

    /// Drop cached records and counters.
    pub fn reset(&mut self) {
        self.cache.reset();
        self.stats = ScanStats::default();
    }

    fn root_reference(&self) -> RecordReference {
        RecordReference::new(self.volume.geometry().root_record, 0)
    }

    pub fn load_record(&mut self, reference: RecordReference) -> Result<Rc<MftRecord>> {
        self.cache.load_cached(&mut self.volume, reference)
    }

    /// Children of the directory stored in record `reference`.
    pub(crate) fn list_directory(&mut self, reference: RecordReference) -> Result<Listing> {
        let record = self.load_record(reference)?;
        let mut node = DirectoryNode::open(
            &mut self.volume,
            &mut self.cache,
            &record,
            self.config.max_fragments,
        )?;
        let preloaded = node.preload(&mut self.volume);
        self.stats.cluster_reads += node.cluster_reads;
        preloaded?;
        node.children(self.config.alloc_scan)
    }

    fn read_volume_label(&mut self) -> Result<Option<String>> {
        let record = self.load_record(RecordReference::new(VOLUME_RECORD, 0))?;
        let found = resolve(
            &mut self.volume,
            &mut self.cache,
            &record,
            AttributeType::VolumeName,
            self.config.max_fragments,
        )?;
        let Some(located) = found.first() else {
            return Ok(None);
        };
        let raw = read_value(&mut self.volume, located)?;
        Ok(Some(ByteView::new(&raw).utf16_at(0, raw.len() / 2)?))
    }

    /// Name of the pseudo root: the configured label, else the $Volume
    /// label, else `.`.
    pub fn volume_label(&mut self) -> String {
        if let Some(label) = &self.config.volume_label {
            return label.clone();
        }
        match self.read_volume_label() {
            Ok(Some(label)) if !label.is_empty() => label,
            Ok(_) => ".".to_string(),
            Err(e) => {
                warn!("Cannot read the volume label: {e}");
                ".".to_string()
            }
        }
    }

    /// Rebuild the whole directory tree. Broken subtrees are left out with
    /// a warning; only a runaway recursion fails the scan.
    pub fn enumerate(&mut self) -> Result<LeveledCache> {
        self.reset();
        let label = self.volume_label();
        let root_ref = match self.load_record(self.root_reference()) {
            Ok(record) => record.reference,
            Err(e) => {
                self.cache.reset();
                return Err(e);
            }
        };

        let mut tree = LeveledCache::new();
        let root = tree.set_root(
            root_ref,
            FileNameRecord::synthetic(
                root_ref,
                &label,
                FILE_ATTRIBUTE_DIRECTORY | FILE_NAME_INDEX_PRESENT,
            ),
        );
        let result = enumerate_into(self, &mut tree, root, 1);
        self.release();

        let total = result?;
        info!(
            "Scanned {} directories and {} files ({} bytes), {} subtrees skipped",
            self.stats.directories, self.stats.files, total, self.stats.skipped
        );
        debug!(
            "{} records loaded, {} cluster reads",
            self.stats.records_loaded, self.stats.cluster_reads
        );
        Ok(tree)
    }

    /// Walk `path` from the root with one index lookup per component.
    pub fn resolve_path(&mut self, path: &str) -> Result<(RecordReference, FileNameRecord)> {
        self.reset();
        let result = self.lookup_path(path);
        self.release();
        result
    }

    /// Total size of everything below `path`, or the size of `path` itself
    /// when it names a file. Only that subtree is enumerated.
    pub fn directory_size(&mut self, path: &str) -> Result<u64> {
        self.reset();
        let result = self.size_below(path);
        self.release();
        result
    }

    /// Fold the cache counters into the stats and drop the cached records.
    fn release(&mut self) {
        let cache_stats = self.cache.stats();
        self.stats.records_loaded = cache_stats.record_reads;
        self.stats.cluster_reads += cache_stats.cluster_reads;
        self.cache.reset();
    }

    fn lookup_path(&mut self, path: &str) -> Result<(RecordReference, FileNameRecord)> {
        let root = self.load_record(self.root_reference())?.reference;
        let mut current = (
            root,
            FileNameRecord::synthetic(root, "", FILE_ATTRIBUTE_DIRECTORY | FILE_NAME_INDEX_PRESENT),
        );
        for component in path.split(['/', '\\']).filter(|c| !c.is_empty()) {
            if !current.1.is_directory() {
                return Err(DirTreeError::NotFound(format!(
                    "{path}: {} is not a directory",
                    current.1.name
                )));
            }
            let record = self.load_record(current.0)?;
            let node = DirectoryNode::open(
                &mut self.volume,
                &mut self.cache,
                &record,
                self.config.max_fragments,
            )?;
            current = node
                .find(&mut self.volume, component)?
                .ok_or_else(|| DirTreeError::NotFound(format!("{path}: no entry {component}")))?;
            debug!("{component} -> record {}", current.0);
        }
        Ok(current)
    }

    fn size_below(&mut self, path: &str) -> Result<u64> {
        let (reference, name) = self.lookup_path(path)?;
        if !name.is_directory() {
            return Ok(name.real_size);
        }
        let depth = path.split(['/', '\\']).filter(|c| !c.is_empty()).count() + 1;
        let mut subtree = LeveledCache::new();
        let top = subtree.set_root(reference, name);
        enumerate_into(self, &mut subtree, top, depth)
    }
}
