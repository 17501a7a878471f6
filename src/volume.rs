//! Raw volume access.
//!
//! The tree builder only ever talks to a `Volume`: read N clusters from an
//! LCN, or fetch one MFT record by reference. `ImageVolume` implements it on
//! top of any `Read + Seek` partition image.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};

use crate::error::{DirTreeError, Result};
use crate::pbs::PartitionBootSector;
use crate::record::{AttributeType, MftRecord, RecordReference};
use crate::runs::{DataRun, check_coverage, total_clusters};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VolumeGeometry {
    pub bytes_per_cluster: u32,
    pub bytes_per_sector: u32,
    pub bytes_per_mft_record: u32,
    pub index_block_size: u32,
    pub total_clusters: u64,
    pub root_record: u32,
}

pub trait Volume {
    fn geometry(&self) -> &VolumeGeometry;

    /// Exactly `count * bytes_per_cluster` bytes starting at cluster `lcn`.
    fn read_clusters(&mut self, lcn: u64, count: u64) -> Result<Vec<u8>>;

    /// Raw bytes of the record slot named by `reference`. Implementations
    /// may hand back whatever currently occupies the slot; callers validate.
    fn fetch_record(&mut self, reference: RecordReference) -> Result<Vec<u8>>;
}

/// Bytes from VCN 0 to the end of the last run.
pub fn mapped_bytes(runs: &[DataRun], bytes_per_cluster: u64) -> Result<u64> {
    let end = runs.iter().map(DataRun::end_vcn).max().unwrap_or(0);
    end.checked_mul(bytes_per_cluster)
        .ok_or_else(|| DirTreeError::Corruption(format!("run list ends at VCN {end}")))
}

/// Read `len` bytes at byte `offset` of a non-resident stream described by
/// `runs`. Sparse runs read as zeros.
///
/// A read past the last run is `NotFound`; one larger than the volume is
/// `Corruption`. Nothing is allocated before both checks pass.
pub fn read_stream<V: Volume + ?Sized>(
    volume: &mut V,
    runs: &[DataRun],
    offset: u64,
    len: usize,
) -> Result<Vec<u8>> {
    let geometry = volume.geometry();
    let bpc = geometry.bytes_per_cluster as u64;
    let volume_bytes = geometry.total_clusters.saturating_mul(bpc);
    if len as u64 > volume_bytes {
        return Err(DirTreeError::Corruption(format!(
            "stream read of {len} bytes exceeds the {volume_bytes} byte volume"
        )));
    }
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| DirTreeError::Corruption(format!("stream read at {offset} overflows")))?;
    let mapped = mapped_bytes(runs, bpc)?;
    if end > mapped {
        return Err(DirTreeError::NotFound(format!(
            "stream bytes {offset}..{end} lie past the {mapped} mapped bytes"
        )));
    }

    let mut out = Vec::with_capacity(len);
    let mut pos = offset;

    while out.len() < len {
        let vcn = pos / bpc;
        let in_cluster = (pos % bpc) as usize;
        let run = runs.iter().find(|r| r.contains(vcn)).ok_or_else(|| {
            DirTreeError::NotFound(format!("VCN {vcn} is not mapped by the run list"))
        })?;

        let wanted = len - out.len();
        let clusters = ((in_cluster + wanted) as u64).div_ceil(bpc).min(run.end_vcn() - vcn);
        let chunk = match run.lcn {
            Some(lcn) => volume.read_clusters(lcn + (vcn - run.vcn), clusters)?,
            None => vec![0u8; (clusters * bpc) as usize],
        };
        let take = wanted.min(chunk.len() - in_cluster);
        out.extend_from_slice(&chunk[in_cluster..in_cluster + take]);
        pos += take as u64;
    }
    Ok(out)
}

pub struct ImageVolume<T: Read + Seek> {
    pub pbs: PartitionBootSector,
    body: T,
    geometry: VolumeGeometry,
    mft_runs: Option<Vec<DataRun>>, // Cached DATA run-list of the MFT itself
}

impl<T: Read + Seek> ImageVolume<T> {
    pub fn new(mut body: T) -> Result<Self> {
        body.seek(SeekFrom::Start(0))?;
        let mut sp_data = vec![0u8; 512];
        body.read_exact(&mut sp_data)?;
        let pbs = PartitionBootSector::from_bytes(&sp_data)?;
        pbs.validate()?;
        let geometry = pbs.geometry();
        info!(
            "NTFS volume: {} byte clusters, {} byte records, $MFT at cluster {}",
            geometry.bytes_per_cluster, geometry.bytes_per_mft_record, pbs.mft_cluster
        );
        Ok(Self {
            pbs,
            body,
            geometry,
            mft_runs: None,
        })
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.body.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.body.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Load the MFT run-list if not loaded yet. Record 0 always lives in the
    /// first extent, at the cluster the boot sector names.
    fn ensure_mft_runs(&mut self) -> Result<()> {
        if self.mft_runs.is_some() {
            return Ok(());
        }
        debug!("Loading MFT run-list (not loaded).");

        let raw = self.read_at(
            self.pbs.mft_address(),
            self.geometry.bytes_per_mft_record as usize,
        )?;
        let rec0 = MftRecord::from_bytes(&raw, self.geometry.bytes_per_sector as usize)?;
        let data = rec0
            .first(AttributeType::Data)
            .filter(|a| !a.is_resident())
            .ok_or_else(|| {
                DirTreeError::InvalidVolume(
                    "non-resident DATA attribute not found in $MFT record 0".to_string(),
                )
            })?;
        let runs = rec0.data_runs(data)?;
        if let crate::record::Attribute::NonResident { non_resident, .. } = data {
            check_coverage(&runs, non_resident.lowest_vcn, non_resident.highest_vcn);
        }
        debug!("$MFT spans {} runs", runs.len());
        self.mft_runs = Some(runs);
        Ok(())
    }

    pub fn mft_records_count(&mut self) -> Result<u64> {
        self.ensure_mft_runs()?;
        let clusters = self.mft_runs.as_deref().map(total_clusters).unwrap_or(0);
        Ok(clusters * self.geometry.bytes_per_cluster as u64
            / self.geometry.bytes_per_mft_record as u64)
    }
}

impl<T: Read + Seek> Volume for ImageVolume<T> {
    fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    fn read_clusters(&mut self, lcn: u64, count: u64) -> Result<Vec<u8>> {
        if lcn.saturating_add(count) > self.geometry.total_clusters {
            return Err(DirTreeError::Corruption(format!(
                "clusters {lcn}+{count} lie beyond the end of the volume"
            )));
        }
        let bpc = self.geometry.bytes_per_cluster as u64;
        self.read_at(lcn * bpc, (count * bpc) as usize)
    }

    fn fetch_record(&mut self, reference: RecordReference) -> Result<Vec<u8>> {
        self.ensure_mft_runs()?;
        let runs = self.mft_runs.take().unwrap_or_default();
        let size = self.geometry.bytes_per_mft_record as usize;
        let offset = reference.index as u64 * size as u64;
        let result = read_stream(self, &runs, offset, size);
        self.mft_runs = Some(runs);
        let raw = result?;
        debug!("MFT entry {} read from stream offset 0x{:X}", reference, offset);
        Ok(raw)
    }
}
