// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The address space answering transactions that arrive over the link.

use crate::error::Error;
use itertools::Itertools;
use num::Integer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

const PAGE_SIZE: u64 = 4096;

/// One configured address range.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct RegionDescriptor {
    pub base: u64,
    pub length: u64,
    /// Accesses must start on, and cover a multiple of, this many bytes.
    #[serde(default = "default_granularity")]
    pub granularity: u64,
}

fn default_granularity() -> u64 {
    1
}

impl RegionDescriptor {
    pub fn new(base: u64, length: u64, granularity: u64) -> Self {
        Self {
            base,
            length,
            granularity,
        }
    }

    /// One past the last address; `None` for descriptors that wrap.
    fn end(&self) -> Option<u64> {
        self.base.checked_add(self.length)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.length == 0 || self.end().is_none() || !self.granularity.is_power_of_two() {
            return Err(Error::InvalidRegion(self.base));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryStatus {
    Ok,
    OutOfRange,
    Misaligned,
}

impl fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryStatus::Ok => f.write_str("OK"),
            MemoryStatus::OutOfRange => f.write_str("OUT_OF_RANGE"),
            MemoryStatus::Misaligned => f.write_str("MISALIGNED"),
        }
    }
}

/// Byte-addressed memory behind a set of non-overlapping regions.
///
/// Storage is allocated in pages on first write; unwritten bytes read as
/// zero. Every access must lie entirely within one region.
#[derive(Clone, Debug, Default)]
pub struct MemoryModel {
    /// sorted by base address
    regions: Vec<RegionDescriptor>,
    pages: HashMap<u64, Box<[u8]>>,
}

impl MemoryModel {
    pub fn new(regions: &[RegionDescriptor]) -> Result<Self, Error> {
        for region in regions {
            region.validate()?;
        }
        let mut regions = regions.to_vec();
        regions.sort_by_key(|region| region.base);
        for (first, second) in regions.iter().tuple_windows() {
            // end() is known to exist after validation
            if first.end().map_or(true, |end| end > second.base) {
                return Err(Error::OverlappingRegions {
                    first: first.base,
                    second: second.base,
                });
            }
        }
        Ok(Self {
            regions,
            pages: HashMap::new(),
        })
    }

    pub fn regions(&self) -> &[RegionDescriptor] {
        &self.regions
    }

    fn region_of(&self, address: u64) -> Option<&RegionDescriptor> {
        let index = self.regions.partition_point(|region| region.base <= address);
        let region = self.regions.get(index.checked_sub(1)?)?;
        match region.end() {
            Some(end) if address < end => Some(region),
            _ => None,
        }
    }

    fn check(&self, address: u64, length: u64) -> MemoryStatus {
        let region = match self.region_of(address) {
            Some(region) => region,
            None => return MemoryStatus::OutOfRange,
        };
        let in_range = match (address.checked_add(length), region.end()) {
            (Some(last), Some(end)) => last <= end,
            _ => false,
        };
        if !in_range {
            return MemoryStatus::OutOfRange;
        }
        if !Integer::is_multiple_of(&address, &region.granularity)
            || !Integer::is_multiple_of(&length, &region.granularity)
        {
            return MemoryStatus::Misaligned;
        }
        MemoryStatus::Ok
    }

    fn byte(&self, address: u64) -> u8 {
        let (page, offset) = Integer::div_rem(&address, &PAGE_SIZE);
        self.pages
            .get(&page)
            .map_or(0, |bytes| bytes[offset as usize])
    }

    /// Returns the bytes read, or an empty vector when the status is not
    /// `Ok`.
    pub fn read(&self, address: u64, length: u64) -> (Vec<u8>, MemoryStatus) {
        let status = self.check(address, length);
        if status != MemoryStatus::Ok {
            log::debug!(
                "read of {} bytes @{:#x} rejected: {}",
                length,
                address,
                status
            );
            return (Vec::new(), status);
        }
        let data = (address..address + length).map(|a| self.byte(a)).collect();
        (data, status)
    }

    /// Writes all of `data` or nothing.
    pub fn write(&mut self, address: u64, data: &[u8]) -> MemoryStatus {
        let status = self.check(address, data.len() as u64);
        if status != MemoryStatus::Ok {
            log::debug!(
                "write of {} bytes @{:#x} rejected: {}",
                data.len(),
                address,
                status
            );
            return status;
        }
        for (a, value) in (address..).zip(data.iter()) {
            let (page, offset) = Integer::div_rem(&a, &PAGE_SIZE);
            self.pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice())
                [offset as usize] = *value;
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> MemoryModel {
        MemoryModel::new(&[
            RegionDescriptor::new(0x1_0000, 0x100, 4),
            RegionDescriptor::new(0x0000, 0x1000, 1),
        ])
        .unwrap()
    }

    #[test]
    fn test_configuration_errors() {
        assert_eq!(
            MemoryModel::new(&[
                RegionDescriptor::new(0x0, 0x1000, 1),
                RegionDescriptor::new(0x800, 0x1000, 1),
            ])
            .unwrap_err(),
            Error::OverlappingRegions {
                first: 0x0,
                second: 0x800
            }
        );
        // adjacent regions are fine
        assert!(MemoryModel::new(&[
            RegionDescriptor::new(0x1000, 0x1000, 1),
            RegionDescriptor::new(0x0, 0x1000, 1),
        ])
        .is_ok());
        assert_eq!(
            MemoryModel::new(&[RegionDescriptor::new(0x40, 0, 1)]).unwrap_err(),
            Error::InvalidRegion(0x40)
        );
        assert_eq!(
            MemoryModel::new(&[RegionDescriptor::new(u64::MAX, 2, 1)]).unwrap_err(),
            Error::InvalidRegion(u64::MAX)
        );
        assert_eq!(
            MemoryModel::new(&[RegionDescriptor::new(0, 16, 3)]).unwrap_err(),
            Error::InvalidRegion(0)
        );
        assert!(MemoryModel::new(&[RegionDescriptor::new(0, 16, 0)]).is_err());
    }

    #[test]
    fn test_out_of_range() {
        let mut memory = MemoryModel::new(&[RegionDescriptor::new(0x0, 0x1000, 1)]).unwrap();
        let (data, status) = memory.read(0x2000, 4);
        assert_eq!(status, MemoryStatus::OutOfRange);
        assert!(data.is_empty());
        // straddling the end of a region
        assert_eq!(memory.write(0xffe, &[1, 2, 3, 4]), MemoryStatus::OutOfRange);
        assert_eq!(memory.read(0xffc, 4), (vec![0; 4], MemoryStatus::Ok));
        assert_eq!(memory.read(u64::MAX, 1).1, MemoryStatus::OutOfRange);
    }

    #[test]
    fn test_accesses_do_not_span_regions() {
        let memory = MemoryModel::new(&[
            RegionDescriptor::new(0x0, 0x10, 1),
            RegionDescriptor::new(0x10, 0x10, 1),
        ])
        .unwrap();
        assert_eq!(memory.read(0x0c, 8).1, MemoryStatus::OutOfRange);
        assert_eq!(memory.read(0x10, 8).1, MemoryStatus::Ok);
    }

    #[test]
    fn test_granularity() {
        let mut memory = model();
        assert_eq!(memory.write(0x1_0002, &[0; 4]), MemoryStatus::Misaligned);
        assert_eq!(memory.write(0x1_0000, &[0; 3]), MemoryStatus::Misaligned);
        assert_eq!(memory.write(0x1_0004, &[9; 8]), MemoryStatus::Ok);
        // the byte-granular region accepts anything in range
        assert_eq!(memory.write(0x3, &[1, 2, 3]), MemoryStatus::Ok);
        // zero-length accesses only need an address in range
        assert_eq!(memory.read(0x1_0000, 0), (vec![], MemoryStatus::Ok));
        assert_eq!(memory.read(0x2_0000, 0).1, MemoryStatus::OutOfRange);
    }

    #[test]
    fn test_no_partial_writes() {
        let mut memory = model();
        assert_eq!(memory.write(0x1_00fc, &[0xff; 8]), MemoryStatus::OutOfRange);
        assert_eq!(memory.read(0x1_00fc, 4), (vec![0; 4], MemoryStatus::Ok));
    }

    #[test]
    fn test_read_after_write() {
        let mut memory = model();
        let data = (0..=255u8).cycle().take(5000).collect::<Vec<_>>();
        assert_eq!(memory.write(0x0, &data[..0x1000]), MemoryStatus::Ok);
        let first = memory.read(0xff0, 0x10);
        assert_eq!(first, memory.read(0xff0, 0x10));
        assert_eq!(first.0, data[0xff0..0x1000].to_vec());
        assert_eq!(memory.write(0x1_0010, &[1, 2, 3, 4]), MemoryStatus::Ok);
        assert_eq!(memory.read(0x1_0010, 4), (vec![1, 2, 3, 4], MemoryStatus::Ok));
    }
}
