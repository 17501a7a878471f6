// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS
// - https://flatcap.github.io/linux-ntfs/ntfs/concepts/index_record.html

pub mod attribute;
pub mod bitmap;
pub mod bytes;
pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod fixup;
pub mod index;
pub mod pbs;
pub mod record;
pub mod runs;
pub mod scan;
pub mod tree;
pub mod volume;

#[cfg(test)]
mod testutil;

pub use config::{AllocScanMode, ScanConfig};
pub use error::{DirTreeError, Result};
pub use record::{FileNameRecord, MftRecord, RecordReference};
pub use scan::{ScanContext, ScanStats};
pub use tree::{CacheItem, ItemId, LeveledCache};
pub use volume::{ImageVolume, Volume, VolumeGeometry};
