//! Data run (mapping pairs) decoding for non-resident attributes.
//!
//! Each run starts with a header byte: the low nibble is the width of the
//! cluster count, the high nibble the width of the signed LCN delta. A zero
//! header byte terminates the list.

use log::{trace, warn};
use serde::{Deserialize, Serialize};

use crate::bytes::ByteView;
use crate::error::{DirTreeError, Result};

/// One contiguous VCN range. `lcn` is `None` for a sparse (unmapped) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct DataRun {
    pub vcn: u64,
    pub lcn: Option<u64>,
    pub length: u64,
}

impl DataRun {
    pub fn end_vcn(&self) -> u64 {
        self.vcn.saturating_add(self.length)
    }

    pub fn contains(&self, vcn: u64) -> bool {
        vcn >= self.vcn && vcn < self.end_vcn()
    }
}

/// Decode a mapping-pairs array into runs starting at `start_vcn`.
///
/// Running off the end of `raw` without a terminator is accepted; a header
/// with a zero-width count or fields that spill past `raw` is not.
pub fn decode_runs(raw: &[u8], start_vcn: u64) -> Result<Vec<DataRun>> {
    let view = ByteView::new(raw);
    let mut runs = Vec::new();
    let mut pos = 0usize;
    let mut vcn = start_vcn;
    let mut lcn: i64 = 0;

    while pos < raw.len() {
        let header = view.u8_at(pos)?;
        if header == 0 {
            break;
        }
        pos += 1;

        let len_size = (header & 0x0F) as usize;
        let ofs_size = (header >> 4) as usize;
        if len_size == 0 {
            return Err(DirTreeError::Decode(format!(
                "run header 0x{header:02X} at byte {} has no cluster count",
                pos - 1
            )));
        }
        if len_size > 8 || ofs_size > 8 {
            return Err(DirTreeError::Decode(format!(
                "run header 0x{header:02X} declares fields wider than 8 bytes"
            )));
        }

        let length = view.uint_at(pos, len_size)?;
        pos += len_size;
        if length == 0 {
            return Err(DirTreeError::Decode(format!(
                "zero-length run at VCN {vcn}"
            )));
        }

        let run_lcn = if ofs_size == 0 {
            None
        } else {
            let delta = view.int_at(pos, ofs_size)?;
            pos += ofs_size;
            lcn = lcn.checked_add(delta).ok_or_else(|| {
                DirTreeError::Decode(format!("LCN overflow at VCN {vcn}"))
            })?;
            if lcn < 0 {
                return Err(DirTreeError::Decode(format!(
                    "negative LCN {lcn} at VCN {vcn}"
                )));
            }
            Some(lcn as u64)
        };

        trace!("run vcn={vcn} lcn={run_lcn:?} len={length}");
        runs.push(DataRun {
            vcn,
            lcn: run_lcn,
            length,
        });
        vcn = vcn.checked_add(length).ok_or_else(|| {
            DirTreeError::Decode("VCN overflow in run list".to_string())
        })?;
    }

    Ok(runs)
}

/// Total clusters covered by `runs`.
pub fn total_clusters(runs: &[DataRun]) -> u64 {
    runs.iter().fold(0u64, |acc, r| acc.saturating_add(r.length))
}

/// Compare decoded runs with the VCN range the attribute header declares.
/// A mismatch is logged, the runs are still usable.
pub fn check_coverage(runs: &[DataRun], start_vcn: u64, last_vcn: u64) -> bool {
    let expected = last_vcn.wrapping_sub(start_vcn).wrapping_add(1);
    let got = total_clusters(runs);
    if last_vcn < start_vcn || got != expected {
        warn!(
            "Run list covers {got} clusters but the attribute declares VCN {start_vcn}..={last_vcn}"
        );
        return false;
    }
    true
}

/// Map a VCN to its LCN. `None` if the VCN is unmapped or sparse.
pub fn vcn_to_lcn(runs: &[DataRun], vcn: u64) -> Option<u64> {
    runs.iter()
        .find(|r| r.contains(vcn))
        .and_then(|r| r.lcn.map(|l| l + (vcn - r.vcn)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(runs: &[DataRun], start: u64, last: u64) {
        assert_eq!(runs[0].vcn, start);
        for w in runs.windows(2) {
            assert_eq!(w[1].vcn, w[0].vcn + w[0].length);
        }
        assert!(check_coverage(runs, start, last));
    }

    #[test]
    fn single_run() {
        // 16 clusters at LCN 100
        let runs = decode_runs(&[0x21, 0x10, 0x64, 0x00, 0x00], 0).unwrap();
        assert_eq!(
            runs,
            vec![DataRun {
                vcn: 0,
                lcn: Some(100),
                length: 16
            }]
        );
    }

    #[test]
    fn relative_and_negative_deltas() {
        let raw = [
            0x22, 0x0A, 0x00, 0xE8, 0x03, // 10 clusters at 1000
            0x11, 0x05, 0x9C, // 5 clusters at 1000 - 100
            0x11, 0x03, 0x32, // 3 clusters at 900 + 50
            0x00,
        ];
        let runs = decode_runs(&raw, 0).unwrap();
        let lcns: Vec<_> = runs.iter().map(|r| r.lcn).collect();
        assert_eq!(lcns, vec![Some(1000), Some(900), Some(950)]);
        assert_partition(&runs, 0, 17);
    }

    #[test]
    fn sparse_run_keeps_previous_lcn() {
        let raw = [
            0x11, 0x04, 0x20, // 4 clusters at 32
            0x01, 0x08, // 8 sparse clusters
            0x11, 0x02, 0x10, // 2 clusters at 32 + 16
            0x00,
        ];
        let runs = decode_runs(&raw, 0).unwrap();
        assert_eq!(runs[1].lcn, None);
        assert_eq!(runs[2].lcn, Some(48));
        assert_partition(&runs, 0, 13);
        assert_eq!(vcn_to_lcn(&runs, 5), None);
        assert_eq!(vcn_to_lcn(&runs, 13), Some(49));
    }

    #[test]
    fn honours_start_vcn() {
        let runs = decode_runs(&[0x11, 0x02, 0x05, 0x11, 0x03, 0x10, 0x00], 40).unwrap();
        assert_partition(&runs, 40, 44);
        assert_eq!(vcn_to_lcn(&runs, 42), Some(21));
    }

    #[test]
    fn missing_terminator_is_tolerated() {
        let runs = decode_runs(&[0x11, 0x02, 0x05], 0).unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[test]
    fn zero_width_count_fails() {
        assert!(matches!(
            decode_runs(&[0x10, 0x05, 0x00], 0),
            Err(DirTreeError::Decode(_))
        ));
    }

    #[test]
    fn truncated_fields_fail() {
        assert!(decode_runs(&[0x31, 0x02, 0x05], 0).is_err());
    }

    #[test]
    fn coverage_mismatch_is_reported() {
        let runs = decode_runs(&[0x11, 0x02, 0x05, 0x00], 0).unwrap();
        assert!(!check_coverage(&runs, 0, 7));
    }
}
