// Sources:
// - https://en.wikipedia.org/wiki/NTFS

//! NTFS Partition Boot Sector, reduced to what is needed to derive the
//! volume geometry.

use byteorder::{LittleEndian, ReadBytesExt};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::error::{DirTreeError, Result};
use crate::record::ROOT_RECORD;
use crate::volume::VolumeGeometry;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartitionBootSector {
    pub oem_id: [u8; 8],                // 0x03 "NTFS    "
    pub bytes_per_sector: u16,          // 0x0B
    pub sectors_per_cluster: u8,        // 0x0D
    pub total_sectors: u64,             // 0x28
    pub mft_cluster: u64,               // 0x30
    pub mft_mirror_cluster: u64,        // 0x38
    pub clusters_per_file_record: i8,   // 0x40  (may be negative)
    pub clusters_per_index_buffer: i8,  // 0x44  (may be negative)
    pub volume_serial_number: u64,      // 0x48
    pub end_of_sector_marker: u16,      // 0x1FE (0xAA55)
}

impl PartitionBootSector {
    pub const NTFS_OEM_ID: [u8; 8] = *b"NTFS    ";

    /// Parse the first 512 bytes of the partition.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 512 {
            return Err(DirTreeError::InvalidVolume(
                "boot sector must be at least 512 bytes".to_string(),
            ));
        }
        let mut c = Cursor::new(buf);

        c.seek(SeekFrom::Start(0x03))?;
        let mut oem_id = [0u8; 8];
        c.read_exact(&mut oem_id)?;
        let bytes_per_sector = c.read_u16::<LittleEndian>()?;
        let sectors_per_cluster = c.read_u8()?;

        c.seek(SeekFrom::Start(0x28))?;
        let total_sectors = c.read_u64::<LittleEndian>()?;
        let mft_cluster = c.read_u64::<LittleEndian>()?;
        let mft_mirror_cluster = c.read_u64::<LittleEndian>()?;
        let clusters_per_file_record = c.read_i8()?;
        c.seek(SeekFrom::Current(3))?;
        let clusters_per_index_buffer = c.read_i8()?;
        c.seek(SeekFrom::Current(3))?;
        let volume_serial_number = c.read_u64::<LittleEndian>()?;

        c.seek(SeekFrom::Start(0x1FE))?;
        let end_of_sector_marker = c.read_u16::<LittleEndian>()?;

        Ok(Self {
            oem_id,
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors,
            mft_cluster,
            mft_mirror_cluster,
            clusters_per_file_record,
            clusters_per_index_buffer,
            volume_serial_number,
            end_of_sector_marker,
        })
    }

    pub fn oem_id_is_valid(&self) -> bool {
        self.oem_id == Self::NTFS_OEM_ID
    }

    pub fn cluster_size(&self) -> u32 {
        self.sectors_per_cluster as u32 * self.bytes_per_sector as u32
    }

    /// Positive: a cluster count. Negative: 2^-n bytes.
    fn decode_size(&self, raw: i8) -> u32 {
        if raw > 0 {
            raw as u32 * self.cluster_size()
        } else {
            1u32 << (-(raw as i32)) as u32
        }
    }

    pub fn file_record_size(&self) -> u32 {
        self.decode_size(self.clusters_per_file_record)
    }

    pub fn index_block_size(&self) -> u32 {
        self.decode_size(self.clusters_per_index_buffer)
    }

    pub fn mft_address(&self) -> u64 {
        self.mft_cluster * self.cluster_size() as u64
    }

    /// Sanity-check the values the scan depends on.
    pub fn validate(&self) -> Result<()> {
        if !self.oem_id_is_valid() {
            return Err(DirTreeError::InvalidVolume(
                "the OEM identifier is not valid".to_string(),
            ));
        }
        let sector = self.bytes_per_sector as u32;
        if !sector.is_power_of_two() || !(256..=4096).contains(&sector) {
            return Err(DirTreeError::InvalidVolume(format!(
                "unsupported sector size {sector}"
            )));
        }
        if self.sectors_per_cluster == 0 || !self.sectors_per_cluster.is_power_of_two() {
            return Err(DirTreeError::InvalidVolume(format!(
                "unsupported sectors per cluster {}",
                self.sectors_per_cluster
            )));
        }
        if !(-31..=64).contains(&self.clusters_per_file_record)
            || !(-31..=64).contains(&self.clusters_per_index_buffer)
            || self.clusters_per_file_record == 0
            || self.clusters_per_index_buffer == 0
        {
            return Err(DirTreeError::InvalidVolume(
                "record or index block size out of range".to_string(),
            ));
        }
        if self.file_record_size() % sector != 0 || self.index_block_size() % sector != 0 {
            return Err(DirTreeError::InvalidVolume(
                "record or index block size is not a whole number of sectors".to_string(),
            ));
        }
        Ok(())
    }

    pub fn geometry(&self) -> VolumeGeometry {
        VolumeGeometry {
            bytes_per_cluster: self.cluster_size(),
            bytes_per_sector: self.bytes_per_sector as u32,
            bytes_per_mft_record: self.file_record_size(),
            index_block_size: self.index_block_size(),
            total_clusters: self.total_sectors / self.sectors_per_cluster.max(1) as u64,
            root_record: ROOT_RECORD,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "pbs": serde_json::to_value(self).unwrap_or_else(|_| json!({})),
            "geometry": serde_json::to_value(self.geometry()).unwrap_or_else(|_| json!({})),
        })
    }

    pub fn to_string(&self) -> String {
        let mut t = Table::new();
        t.add_row(row!["Partition Boot Sector"]);
        t.add_row(row![b -> "OEM ID", String::from_utf8_lossy(&self.oem_id)]);
        t.add_row(row![b -> "Bytes per sector", self.bytes_per_sector]);
        t.add_row(row![b -> "Cluster size", self.cluster_size()]);
        t.add_row(row![b -> "Total sectors", self.total_sectors]);
        t.add_row(row![b -> "$MFT cluster", self.mft_cluster]);
        t.add_row(row![b -> "$MFTMirr cluster", self.mft_mirror_cluster]);
        t.add_row(row![b -> "File record size", self.file_record_size()]);
        t.add_row(row![b -> "Index block size", self.index_block_size()]);
        t.add_row(row![b -> "Serial number", format!("{:016X}", self.volume_serial_number)]);
        t.to_string()
    }
}
