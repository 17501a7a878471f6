//! Attribute resolution across base and extension records.
//!
//! An attribute of a record is either stored in the record itself or, when
//! the record overflowed, named by an $ATTRIBUTE_LIST entry that points at
//! the extension record holding it.

use log::{debug, trace, warn};
use std::collections::HashSet;
use std::rc::Rc;

use crate::bytes::ByteView;
use crate::cache::RecordCache;
use crate::error::{DirTreeError, Result};
use crate::record::{Attribute, AttributeType, MftRecord, RecordReference};
use crate::runs::DataRun;
use crate::volume::{Volume, mapped_bytes, read_stream};

/// An attribute together with the record whose buffer holds it.
#[derive(Debug, Clone)]
pub struct Located {
    pub record: Rc<MftRecord>,
    pub attribute: Attribute,
}

impl Located {
    pub fn value(&self) -> Result<&[u8]> {
        self.record.resident_value(&self.attribute)
    }

    pub fn data_runs(&self) -> Result<Vec<DataRun>> {
        self.record.data_runs(&self.attribute)
    }

    pub fn is_resident(&self) -> bool {
        self.attribute.is_resident()
    }

    pub fn lowest_vcn(&self) -> u64 {
        match &self.attribute {
            Attribute::NonResident { non_resident, .. } => non_resident.lowest_vcn,
            Attribute::Resident { .. } => 0,
        }
    }
}

/// One $ATTRIBUTE_LIST entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeListEntry {
    pub attr_type: u32,
    pub length: u16,
    pub name: Option<String>,
    pub starting_vcn: u64,
    pub reference: RecordReference,
    pub id: u16,
}

/// Decode an $ATTRIBUTE_LIST value. A damaged entry ends the list.
pub fn parse_attribute_list(raw: &[u8]) -> Vec<AttributeListEntry> {
    let view = ByteView::new(raw);
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset + 0x1A <= raw.len() {
        match parse_list_entry(view, offset) {
            Ok(entry) => {
                offset += entry.length as usize;
                entries.push(entry);
            }
            Err(e) => {
                warn!("Attribute list truncated at byte {offset}: {e}");
                break;
            }
        }
    }
    entries
}

fn parse_list_entry(view: ByteView<'_>, offset: usize) -> Result<AttributeListEntry> {
    let length = view.u16_at(offset + 0x04)?;
    if length < 0x1A {
        return Err(DirTreeError::Corruption(format!(
            "attribute list entry of {length} bytes"
        )));
    }
    let entry = view.sub(offset, length as usize)?;
    let name_len = entry.u8_at(0x06)? as usize;
    let name_off = entry.u8_at(0x07)? as usize;
    Ok(AttributeListEntry {
        attr_type: entry.u32_at(0x00)?,
        length,
        name: if name_len > 0 {
            Some(entry.utf16_at(name_off, name_len)?)
        } else {
            None
        },
        starting_vcn: entry.u64_at(0x08)?,
        reference: RecordReference::from_u64(entry.u64_at(0x10)?),
        id: entry.u16_at(0x18)?,
    })
}

/// Read the whole value of an attribute: the inline bytes if resident,
/// otherwise `real_size` bytes gathered through its runs. A `real_size`
/// beyond what the runs map is cut down to the mapped bytes.
pub fn read_value<V: Volume + ?Sized>(volume: &mut V, located: &Located) -> Result<Vec<u8>> {
    match &located.attribute {
        Attribute::Resident { .. } => Ok(located.value()?.to_vec()),
        Attribute::NonResident { non_resident, .. } => {
            let runs = located.data_runs()?;
            let mapped = mapped_bytes(&runs, volume.geometry().bytes_per_cluster as u64)?;
            let size = non_resident.real_size;
            if size > mapped {
                warn!(
                    "Record {}: attribute claims {size} bytes but its runs map {mapped}",
                    located.record.reference
                );
            }
            let len = usize::try_from(size.min(mapped)).map_err(|_| {
                DirTreeError::Corruption(format!("attribute of {mapped} bytes is not addressable"))
            })?;
            read_stream(volume, &runs, 0, len)
        }
    }
}

/// Non-resident attribute list value, cluster reads memoised in the cache.
fn read_list_value<V: Volume + ?Sized>(
    volume: &mut V,
    cache: &mut RecordCache,
    record: &MftRecord,
    list: &Attribute,
) -> Result<Vec<u8>> {
    let runs = record.data_runs(list)?;
    if runs.len() != 1 || runs[0].length != 1 {
        debug!(
            "Record {}: attribute list spans {} runs / {} clusters",
            record.reference,
            runs.len(),
            crate::runs::total_clusters(&runs)
        );
    }
    let want = list.value_size() as usize;
    let mut out = Vec::new();
    let bpc = volume.geometry().bytes_per_cluster as u64;
    for run in &runs {
        if out.len() >= want {
            break;
        }
        match run.lcn {
            Some(lcn) => out.extend_from_slice(&cache.load_clusters(volume, lcn, run.length)?),
            None => {
                let hole = run.length.checked_mul(bpc).ok_or_else(|| {
                    DirTreeError::Corruption(format!(
                        "record {}: attribute list hole of {} clusters",
                        record.reference, run.length
                    ))
                })?;
                let hole = usize::try_from(hole).unwrap_or(usize::MAX);
                out.resize(out.len().saturating_add(hole).min(want), 0);
            }
        }
    }
    out.truncate(want);
    Ok(out)
}

/// Every instance of `ty` belonging to `record`, following its attribute
/// list into extension records. At most `limit` results.
pub fn resolve<V: Volume + ?Sized>(
    volume: &mut V,
    cache: &mut RecordCache,
    record: &Rc<MftRecord>,
    ty: AttributeType,
    limit: usize,
) -> Result<Vec<Located>> {
    if let Some(attr) = record.first(ty) {
        return Ok(vec![Located {
            record: Rc::clone(record),
            attribute: attr.clone(),
        }]);
    }

    let Some(list) = record.first(AttributeType::AttributeList) else {
        if !ty.may_be_absent() {
            debug!("Record {} has no {:?} attribute", record.reference, ty);
        }
        return Ok(Vec::new());
    };

    let list_bytes = match list {
        Attribute::Resident { .. } => record.resident_value(list)?.to_vec(),
        Attribute::NonResident { .. } => read_list_value(volume, cache, record, list)?,
    };

    let mut visited = HashSet::from([record.reference.slot()]);
    let mut found = Vec::new();

    for entry in parse_attribute_list(&list_bytes) {
        if entry.attr_type != ty as u32 {
            continue;
        }
        if entry.starting_vcn != 0 {
            match ty {
                AttributeType::Data => {
                    debug!(
                        "Record {}: DATA fragment at VCN {} is not stitched",
                        record.reference, entry.starting_vcn
                    );
                    continue;
                }
                AttributeType::IndexAllocation => {}
                _ => warn!(
                    "Record {}: {:?} attribute list entry starts at VCN {}",
                    record.reference, ty, entry.starting_vcn
                ),
            }
        }
        if !visited.insert(entry.reference.slot()) {
            trace!("Record {} already visited", entry.reference);
            continue;
        }
        if found.len() >= limit {
            warn!(
                "Record {}: more than {} {:?} fragments, ignoring the rest",
                record.reference, limit, ty
            );
            break;
        }

        let extension = match cache.load_cached(volume, entry.reference) {
            Ok(ext) => ext,
            Err(e) => {
                warn!(
                    "Record {}: extension record {} unavailable: {e}",
                    record.reference, entry.reference
                );
                continue;
            }
        };
        if extension.header.base_file_record.slot() != record.reference.slot() {
            warn!(
                "Extension record {} claims base {} instead of {}",
                extension.reference, extension.header.base_file_record, record.reference
            );
        }
        match extension.first(ty) {
            Some(attr) => found.push(Located {
                record: Rc::clone(&extension),
                attribute: attr.clone(),
            }),
            None => warn!(
                "Extension record {} lacks the {:?} attribute its base lists",
                extension.reference, ty
            ),
        }
    }

    if found.is_empty() && !ty.may_be_absent() {
        warn!(
            "Record {}: no {:?} attribute found through its attribute list",
            record.reference, ty
        );
    }
    found.sort_by_key(Located::lowest_vcn);
    Ok(found)
}
