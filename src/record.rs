// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

use chrono::{TimeZone, Utc};
use core::convert::TryFrom;
use log::{debug, trace, warn};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

use crate::bytes::ByteView;
use crate::error::{DirTreeError, Result};
use crate::fixup::apply_fixups;
use crate::runs::{DataRun, decode_runs};

pub const FILE_MAGIC: &[u8; 4] = b"FILE";
pub const BAAD_MAGIC: &[u8; 4] = b"BAAD";
pub const ATTRIBUTE_END: u32 = 0xFFFF_FFFF;

pub const RECORD_IN_USE: u16 = 0x0001;
pub const RECORD_IS_DIRECTORY: u16 = 0x0002;

/// Well-known record numbers.
pub const MFT_RECORD: u32 = 0;
pub const VOLUME_RECORD: u32 = 3;
pub const ROOT_RECORD: u32 = 5;

// File attribute bits carried in $FILE_NAME / $STANDARD_INFORMATION.
pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0000_0002;
pub const FILE_ATTRIBUTE_SYSTEM: u32 = 0x0000_0004;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
pub const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x0000_0400;
pub const FILE_NAME_INDEX_PRESENT: u32 = 0x1000_0000;

/// 64-bit file reference: 32-bit record index, 16-bit high index part and
/// 16-bit reuse sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct RecordReference {
    pub index: u32,
    pub extension: u16,
    pub sequence: u16,
}

impl RecordReference {
    pub const fn new(index: u32, sequence: u16) -> Self {
        Self {
            index,
            extension: 0,
            sequence,
        }
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            index: raw as u32,
            extension: (raw >> 32) as u16,
            sequence: (raw >> 48) as u16,
        }
    }

    pub fn to_u64(self) -> u64 {
        self.index as u64 | (self.extension as u64) << 32 | (self.sequence as u64) << 48
    }

    /// Identity of the physical slot, ignoring the reuse generation.
    pub fn slot(self) -> (u32, u16) {
        (self.index, self.extension)
    }

    pub fn is_null(self) -> bool {
        self.to_u64() == 0
    }
}

impl fmt::Display for RecordReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = (self.extension as u64) << 32 | self.index as u64;
        write!(f, "{}-{}", record, self.sequence)
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum AttributeType {
    StandardInformation = 0x10,
    AttributeList = 0x20,
    FileName = 0x30,
    ObjectId = 0x40,
    SecurityDescriptor = 0x50,
    VolumeName = 0x60,
    VolumeInformation = 0x70,
    Data = 0x80,
    IndexRoot = 0x90,
    IndexAllocation = 0xA0,
    Bitmap = 0xB0,
    ReparsePoint = 0xC0,
    EaInformation = 0xD0,
    Ea = 0xE0,
    PropertySet = 0xF0,
    LoggedUtilityStream = 0x100,
}

/// Number of entries in a per-record dense attribute table.
pub const ATTRIBUTE_SLOTS: usize = (AttributeType::LoggedUtilityStream as usize >> 4) + 1;

impl AttributeType {
    /// Dense table position: the type code divided by 16.
    pub fn slot(self) -> usize {
        self as usize >> 4
    }

    /// Types that may legitimately occur more than once per record.
    pub fn allows_multiple(self) -> bool {
        matches!(
            self,
            AttributeType::FileName | AttributeType::LoggedUtilityStream
        )
    }

    /// Types a directory can legitimately lack.
    pub fn may_be_absent(self) -> bool {
        matches!(
            self,
            AttributeType::Bitmap | AttributeType::IndexAllocation
        )
    }
}

impl TryFrom<u32> for AttributeType {
    type Error = DirTreeError;
    fn try_from(value: u32) -> Result<Self> {
        use AttributeType::*;
        Ok(match value {
            0x10 => StandardInformation,
            0x20 => AttributeList,
            0x30 => FileName,
            0x40 => ObjectId,
            0x50 => SecurityDescriptor,
            0x60 => VolumeName,
            0x70 => VolumeInformation,
            0x80 => Data,
            0x90 => IndexRoot,
            0xA0 => IndexAllocation,
            0xB0 => Bitmap,
            0xC0 => ReparsePoint,
            0xD0 => EaInformation,
            0xE0 => Ea,
            0xF0 => PropertySet,
            0x100 => LoggedUtilityStream,
            _ => {
                return Err(DirTreeError::Decode(format!(
                    "unknown attribute type 0x{value:X}"
                )));
            }
        })
    }
}

/// Header found at the very beginning of every **FILE** record (offset 0).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRecordHeader {
    pub usa_offset: u16,
    pub usa_count: u16,
    pub lsn: u64,
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub attrs_offset: u16,
    pub flags: u16,
    pub bytes_in_use: u32,
    pub bytes_allocated: u32,
    pub base_file_record: RecordReference,
    pub next_attr_id: u16,
    /// Only present from NTFS 3.1 on.
    pub record_number: Option<u32>,
}

impl FileRecordHeader {
    fn parse(view: ByteView<'_>) -> Result<Self> {
        let attrs_offset = view.u16_at(0x14)?;
        Ok(Self {
            usa_offset: view.u16_at(0x04)?,
            usa_count: view.u16_at(0x06)?,
            lsn: view.u64_at(0x08)?,
            sequence_number: view.u16_at(0x10)?,
            hard_link_count: view.u16_at(0x12)?,
            attrs_offset,
            flags: view.u16_at(0x16)?,
            bytes_in_use: view.u32_at(0x18)?,
            bytes_allocated: view.u32_at(0x1C)?,
            base_file_record: RecordReference::from_u64(view.u64_at(0x20)?),
            next_attr_id: view.u16_at(0x28)?,
            record_number: if attrs_offset >= 0x30 {
                Some(view.u32_at(0x2C)?)
            } else {
                None
            },
        })
    }
}

/// Common header part for resident & non‑resident attributes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AttributeHeader {
    pub attr_type: AttributeType,
    /// Byte offset of the attribute inside its record.
    pub offset: usize,
    pub length: u32,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub id: u16,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResidentHeader {
    pub value_length: u32,
    pub value_offset: u16,
    pub indexed: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NonResidentHeader {
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub mapping_pairs_offset: u16,
    pub compression_unit: Option<u16>,
    pub allocated_size: u64,
    pub real_size: u64,
    pub initialized_size: u64,
}

/// One attribute of a record. Payloads are not copied: offsets point into
/// the owning `MftRecord`'s buffer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum Attribute {
    Resident {
        header: AttributeHeader,
        resident: ResidentHeader,
    },
    NonResident {
        header: AttributeHeader,
        non_resident: NonResidentHeader,
    },
}

impl Attribute {
    pub fn header(&self) -> &AttributeHeader {
        match self {
            Attribute::Resident { header, .. } | Attribute::NonResident { header, .. } => header,
        }
    }

    pub fn attr_type(&self) -> AttributeType {
        self.header().attr_type
    }

    pub fn is_resident(&self) -> bool {
        matches!(self, Attribute::Resident { .. })
    }

    /// Size of the value: resident length or the non-resident real size.
    pub fn value_size(&self) -> u64 {
        match self {
            Attribute::Resident { resident, .. } => resident.value_length as u64,
            Attribute::NonResident { non_resident, .. } => non_resident.real_size,
        }
    }

    fn parse(record: ByteView<'_>, offset: usize) -> Result<Self> {
        let view = record.sub(offset, record.u32_at(offset + 4)? as usize)?;
        let attr_type = AttributeType::try_from(view.u32_at(0x00)?)?;
        let length = view.u32_at(0x04)?;
        let non_resident = view.u8_at(0x08)? != 0;
        let name_length = view.u8_at(0x09)?;
        let name_offset = view.u16_at(0x0A)?;
        let flags = view.u16_at(0x0C)?;
        let id = view.u16_at(0x0E)?;
        let name = if name_length > 0 {
            Some(view.utf16_at(name_offset as usize, name_length as usize)?)
        } else {
            None
        };

        let header = AttributeHeader {
            attr_type,
            offset,
            length,
            name_length,
            name_offset,
            flags,
            id,
            name,
        };

        if !non_resident {
            let resident = ResidentHeader {
                value_length: view.u32_at(0x10)?,
                value_offset: view.u16_at(0x14)?,
                indexed: view.u8_at(0x16)? & 0x01 != 0,
            };
            // Validate the payload now so accessors cannot fail later.
            view.slice(resident.value_offset as usize, resident.value_length as usize)?;
            Ok(Attribute::Resident { header, resident })
        } else {
            let compression_unit = view.u16_at(0x22)?;
            let non_resident = NonResidentHeader {
                lowest_vcn: view.u64_at(0x10)?,
                highest_vcn: view.u64_at(0x18)?,
                mapping_pairs_offset: view.u16_at(0x20)?,
                compression_unit: (compression_unit != 0).then_some(compression_unit),
                allocated_size: view.u64_at(0x28)?,
                real_size: view.u64_at(0x30)?,
                initialized_size: view.u64_at(0x38)?,
            };
            view.tail(non_resident.mapping_pairs_offset as usize)?;
            Ok(Attribute::NonResident {
                header,
                non_resident,
            })
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum FileNamespace {
    Posix = 0,
    Win32 = 1,
    Dos = 2,
    Win32AndDos = 3,
}

impl FileNamespace {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => FileNamespace::Posix,
            1 => FileNamespace::Win32,
            2 => FileNamespace::Dos,
            3 => FileNamespace::Win32AndDos,
            _ => {
                return Err(DirTreeError::Decode(format!(
                    "unknown file name namespace {value}"
                )));
            }
        })
    }
}

/// Parsed $FILE_NAME value, as stored in a record or as an index key.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FileNameRecord {
    pub parent: RecordReference,
    pub created: u64,
    pub modified: u64,
    pub mft_modified: u64,
    pub accessed: u64,
    pub allocated_size: u64,
    pub real_size: u64,
    pub flags: u32,
    pub reparse_value: u32,
    pub namespace: FileNamespace,
    pub name: String,
}

impl FileNameRecord {
    pub const MIN_SIZE: usize = 0x42;

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let view = ByteView::new(raw);
        let name_len = view.u8_at(0x40)? as usize;
        Ok(Self {
            parent: RecordReference::from_u64(view.u64_at(0x00)?),
            created: view.u64_at(0x08)?,
            modified: view.u64_at(0x10)?,
            mft_modified: view.u64_at(0x18)?,
            accessed: view.u64_at(0x20)?,
            allocated_size: view.u64_at(0x28)?,
            real_size: view.u64_at(0x30)?,
            flags: view.u32_at(0x38)?,
            reparse_value: view.u32_at(0x3C)?,
            namespace: FileNamespace::from_u8(view.u8_at(0x41)?)?,
            name: view.utf16_at(Self::MIN_SIZE, name_len)?,
        })
    }

    /// Name-only record used for synthetic entries such as the volume root.
    pub fn synthetic(parent: RecordReference, name: &str, flags: u32) -> Self {
        Self {
            parent,
            created: 0,
            modified: 0,
            mft_modified: 0,
            accessed: 0,
            allocated_size: 0,
            real_size: 0,
            flags,
            reparse_value: 0,
            namespace: FileNamespace::Win32AndDos,
            name: name.to_string(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.flags & (FILE_NAME_INDEX_PRESENT | FILE_ATTRIBUTE_DIRECTORY) != 0
    }

    pub fn is_reparse_point(&self) -> bool {
        self.flags & FILE_ATTRIBUTE_REPARSE_POINT != 0
    }

    pub fn is_dos_only(&self) -> bool {
        self.namespace == FileNamespace::Dos
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "parent": self.parent.to_string(),
            "allocated": self.allocated_size,
            "size": self.real_size,
            "created": filetime_to_rfc3339(self.created),
            "modified": filetime_to_rfc3339(self.modified),
            "mft_modified": filetime_to_rfc3339(self.mft_modified),
            "accessed": filetime_to_rfc3339(self.accessed),
            "flags": self.flags,
            "namespace": self.namespace,
        })
    }
}

/// A fixed-up MFT record plus a per-type table of its first attributes.
#[derive(Debug, Clone)]
pub struct MftRecord {
    pub reference: RecordReference,
    pub header: FileRecordHeader,
    data: Vec<u8>,
    table: [Option<Attribute>; ATTRIBUTE_SLOTS],
    attributes: Vec<Attribute>,
}

impl MftRecord {
    /// Parse a raw record read from disk. Fixups are applied on a copy.
    pub fn from_bytes(raw: &[u8], sector_size: usize) -> Result<Self> {
        let mut data = raw.to_vec();
        let magic = ByteView::new(&data).slice(0, 4)?;
        if magic == BAAD_MAGIC {
            return Err(DirTreeError::Corruption(
                "record marked BAAD by chkdsk".to_string(),
            ));
        }
        if magic != FILE_MAGIC {
            return Err(DirTreeError::Corruption(format!(
                "record signature is not 'FILE', found: {}",
                String::from_utf8_lossy(magic)
            )));
        }

        apply_fixups(&mut data, sector_size)?;
        let header = FileRecordHeader::parse(ByteView::new(&data))?;

        let mut record = MftRecord {
            reference: RecordReference::new(
                header.record_number.unwrap_or_default(),
                header.sequence_number,
            ),
            header,
            data,
            table: Default::default(),
            attributes: Vec::new(),
        };
        record.index_attributes();
        Ok(record)
    }

    /// Single linear walk of the attribute chain. Damage stops the walk but
    /// keeps what was decoded so far.
    fn index_attributes(&mut self) {
        let view = ByteView::new(&self.data);
        let limit = (self.header.bytes_in_use as usize).min(self.data.len());
        let mut offset = self.header.attrs_offset as usize;

        while offset + 4 <= limit {
            let type_code = match view.u32_at(offset) {
                Ok(v) => v,
                Err(_) => break,
            };
            if type_code == ATTRIBUTE_END {
                break;
            }
            let length = match view.u32_at(offset + 4) {
                Ok(v) => v as usize,
                Err(_) => break,
            };
            if length < 0x18 || offset + length > limit {
                warn!(
                    "Record {}: attribute 0x{type_code:X} at 0x{offset:X} has bad length {length}",
                    self.reference
                );
                break;
            }

            match Attribute::parse(view, offset) {
                Ok(attr) => {
                    let ty = attr.attr_type();
                    let slot = &mut self.table[ty.slot()];
                    match slot {
                        None => *slot = Some(attr.clone()),
                        Some(first) if !ty.allows_multiple() => {
                            if first.header().name.is_none() && attr.header().name.is_none() {
                                warn!(
                                    "Record {}: duplicate {:?} attribute, keeping the first",
                                    self.reference, ty
                                );
                            } else {
                                trace!(
                                    "Record {}: additional named {:?} attribute {:?}",
                                    self.reference,
                                    ty,
                                    attr.header().name
                                );
                            }
                        }
                        Some(_) => {}
                    }
                    self.attributes.push(attr);
                }
                Err(e) => {
                    debug!(
                        "Record {}: skipping attribute at 0x{offset:X}: {e}",
                        self.reference
                    );
                }
            }
            offset += length;
        }
    }

    /// The first attribute of `ty` stored directly in this record.
    pub fn first(&self, ty: AttributeType) -> Option<&Attribute> {
        self.table[ty.slot()].as_ref()
    }

    /// Every attribute of `ty` stored directly in this record, in order.
    pub fn all(&self, ty: AttributeType) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(move |a| a.attr_type() == ty)
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Inline payload of a resident attribute of this record.
    pub fn resident_value(&self, attr: &Attribute) -> Result<&[u8]> {
        match attr {
            Attribute::Resident { header, resident } => ByteView::new(&self.data).slice(
                header.offset + resident.value_offset as usize,
                resident.value_length as usize,
            ),
            Attribute::NonResident { header, .. } => Err(DirTreeError::Consistency(format!(
                "{:?} attribute of record {} is not resident",
                header.attr_type, self.reference
            ))),
        }
    }

    /// Raw mapping pairs of a non-resident attribute of this record.
    pub fn run_list(&self, attr: &Attribute) -> Result<&[u8]> {
        match attr {
            Attribute::NonResident {
                header,
                non_resident,
            } => {
                let start = header.offset + non_resident.mapping_pairs_offset as usize;
                let end = header.offset + header.length as usize;
                ByteView::new(&self.data).slice(start, end.saturating_sub(start))
            }
            Attribute::Resident { header, .. } => Err(DirTreeError::Consistency(format!(
                "{:?} attribute of record {} is resident",
                header.attr_type, self.reference
            ))),
        }
    }

    /// Decoded runs of a non-resident attribute of this record.
    pub fn data_runs(&self, attr: &Attribute) -> Result<Vec<DataRun>> {
        let start_vcn = match attr {
            Attribute::NonResident { non_resident, .. } => non_resident.lowest_vcn,
            Attribute::Resident { .. } => 0,
        };
        decode_runs(self.run_list(attr)?, start_vcn)
    }

    /// Every parsable $FILE_NAME stored directly in this record.
    pub fn file_names(&self) -> Vec<FileNameRecord> {
        self.all(AttributeType::FileName)
            .filter_map(|a| self.resident_value(a).ok())
            .filter_map(|v| FileNameRecord::parse(v).ok())
            .collect()
    }

    /// Preferred display name: anything but the DOS 8.3 alias.
    pub fn primary_name(&self) -> Option<FileNameRecord> {
        let mut names = self.file_names();
        let pos = names.iter().position(|n| !n.is_dos_only()).unwrap_or(0);
        (!names.is_empty()).then(|| names.swap_remove(pos))
    }

    pub fn is_in_use(&self) -> bool {
        self.header.flags & RECORD_IN_USE != 0
    }

    pub fn is_dir(&self) -> bool {
        self.header.flags & RECORD_IS_DIRECTORY != 0
    }

    /// Extension records hold overflow attributes of a base record.
    pub fn is_extension(&self) -> bool {
        !self.header.base_file_record.is_null()
    }

    /// Convert record to a human‑readable table string.
    pub fn to_string(&self) -> String {
        let mut out = String::new();

        let mut hdr = Table::new();
        hdr.add_row(row!["MFT Entry Header Values"]);
        hdr.add_row(row![b -> "Reference", self.reference]);
        hdr.add_row(row![b -> "Sequence", self.header.sequence_number]);
        hdr.add_row(row![b -> "$LogFile Sequence Number", self.header.lsn]);
        hdr.add_row(row![b -> "Flags", record_flags_to_string(self.header.flags)]);
        hdr.add_row(row![b -> "Links", self.header.hard_link_count]);
        if self.is_extension() {
            hdr.add_row(row![b -> "Base Record", self.header.base_file_record]);
        }
        out.push_str(&hdr.to_string());
        out.push('\n');

        let mut attrs = Table::new();
        attrs.add_row(row!["Attributes", "Name", "Status", "Size"]);
        for a in &self.attributes {
            let header = a.header();
            let status = if a.is_resident() {
                "Resident"
            } else {
                "Non‑resident"
            };
            attrs.add_row(row![
                format!(
                    "{:?} (0x{:X}‑#{})",
                    header.attr_type, header.attr_type as u32, header.id
                ),
                header.name.clone().unwrap_or_else(|| "N/A".to_string()),
                status,
                a.value_size()
            ]);
        }
        out.push_str(&attrs.to_string());

        let names = self.file_names();
        if !names.is_empty() {
            let mut t = Table::new();
            t.add_row(row!["$FILE_NAME Attributes"]);
            for fname in names {
                t.add_row(row![b -> "Name", fname.name.clone()]);
                t.add_row(row![b -> "Namespace", format!("{:?}", fname.namespace)]);
                t.add_row(row![b -> "Parent MFT", fname.parent]);
                t.add_row(row![b -> "Allocated", fname.allocated_size]);
                t.add_row(row![b -> "Actual", fname.real_size]);
                t.add_row(row!["‑ Created", filetime_to_rfc3339(fname.created)]);
                t.add_row(row!["‑ Modified", filetime_to_rfc3339(fname.modified)]);
                t.add_row(row!["", ""]);
            }
            out.push('\n');
            out.push_str(&t.to_string());
        }
        out
    }

    pub fn to_json(&self) -> Value {
        json!({
            "reference": self.reference.to_string(),
            "header": &self.header,
            "attributes": &self.attributes,
            "file_names": self.file_names().iter().map(|f| f.to_json()).collect::<Vec<_>>(),
        })
    }
}

/// FILETIME (100ns ticks since 1601) to RFC 3339, empty when out of range.
pub fn filetime_to_rfc3339(ft: u64) -> String {
    const DELTA_MICROS: i64 = 11_644_473_600_000_000;
    let unix_micros = (ft / 10) as i64 - DELTA_MICROS;
    let secs = unix_micros.div_euclid(1_000_000);
    let nanos = unix_micros.rem_euclid(1_000_000) * 1_000;
    Utc.timestamp_opt(secs, nanos as u32)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

fn record_flags_to_string(flags: u16) -> String {
    let mut v = Vec::new();
    if flags & RECORD_IN_USE != 0 {
        v.push("Allocated")
    }
    if flags & RECORD_IS_DIRECTORY != 0 {
        v.push("Directory")
    }
    if flags & 0x0004 != 0 {
        v.push("Extend")
    }
    if flags & 0x0008 != 0 {
        v.push("View Index")
    }
    if v.is_empty() {
        "None".into()
    } else {
        v.join(" | ")
    }
}
