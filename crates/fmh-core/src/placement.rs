//! Section placement chain.
//!
//! Tracks every `[offset, offset + length)` range claimed in the flash image,
//! keyed by offset. A new claim only has to be compared with its immediate
//! predecessor and successor, and the ordered map doubles as the flash map
//! printed after a build.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;
use std::ops::Bound;

use thiserror::Error;

use crate::format::{MODULE_NAME_LEN, Version};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("Section {name} at 0x{offset:08X} overlaps with section {conflicting}")]
    Overlap {
        name: String,
        offset: u32,
        conflicting: String,
    },
}

/// One committed range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRange {
    pub offset: u32,
    pub length: u32,
    pub name: String,
    pub version: Version,
}

impl ClaimedRange {
    /// Exclusive end, widened so ranges touching 4 GiB cannot wrap.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }
}

/// Offset-ordered set of non-overlapping claims.
#[derive(Debug, Clone, Default)]
pub struct SectionChain {
    ranges: BTreeMap<u32, ClaimedRange>,
}

impl SectionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit a range, or leave the chain untouched and report the conflict.
    pub fn claim(
        &mut self,
        offset: u32,
        length: u32,
        name: &str,
        version: Version,
    ) -> Result<(), PlacementError> {
        let name: String = name.chars().take(MODULE_NAME_LEN).collect();
        let end = offset as u64 + length as u64;

        let overlap = |other: &ClaimedRange| PlacementError::Overlap {
            name: name.clone(),
            offset,
            conflicting: other.name.clone(),
        };

        if let Some(same) = self.ranges.get(&offset) {
            return Err(overlap(same));
        }

        // Entry starting before us must end at or before our start.
        if let Some((_, prev)) = self
            .ranges
            .range((Bound::Unbounded, Bound::Excluded(offset)))
            .next_back()
            && (offset as u64) < prev.end()
        {
            return Err(overlap(prev));
        }

        // Entry starting after us must start at or after our end.
        if let Some((_, next)) = self
            .ranges
            .range((Bound::Excluded(offset), Bound::Unbounded))
            .next()
            && end > next.offset as u64
        {
            return Err(overlap(next));
        }

        self.ranges.insert(
            offset,
            ClaimedRange {
                offset,
                length,
                name,
                version,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Claims in ascending offset order.
    pub fn iter(&self) -> impl Iterator<Item = &ClaimedRange> {
        self.ranges.values()
    }

    /// Gaps between claims, from 0 up to `flash_size`.
    pub fn free_regions(&self, flash_size: u32) -> FreeRegions<'_> {
        FreeRegions {
            ranges: self.ranges.values(),
            cursor: 0,
            flash_size: flash_size as u64,
        }
    }

    /// Printable used/free map of the flash.
    pub fn flash_map(&self, flash_size: u32) -> FlashMap<'_> {
        FlashMap {
            chain: self,
            flash_size,
        }
    }
}

/// Free `(start, end)` pairs, computed lazily while walking the chain.
pub struct FreeRegions<'a> {
    ranges: btree_map::Values<'a, u32, ClaimedRange>,
    cursor: u64,
    flash_size: u64,
}

impl Iterator for FreeRegions<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        for range in self.ranges.by_ref() {
            let start = self.cursor;
            self.cursor = self.cursor.max(range.end());
            if (range.offset as u64) > start {
                return Some((start, range.offset as u64));
            }
        }
        if self.cursor < self.flash_size {
            let start = self.cursor;
            self.cursor = self.flash_size;
            return Some((start, self.flash_size));
        }
        None
    }
}

/// Flash memory map report.
pub struct FlashMap<'a> {
    chain: &'a SectionChain,
    flash_size: u32,
}

impl fmt::Display for FlashMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "-".repeat(47);
        writeln!(f, "{rule}")?;
        writeln!(f, "             Flash Memory Map")?;
        writeln!(f, "{rule}")?;

        let mut loc = 0u64;
        for range in self.chain.iter() {
            if range.offset as u64 > loc {
                writeln!(f, "0x{:07X} - 0x{:07X} : *******FREE*******", loc, range.offset)?;
            }
            writeln!(
                f,
                "0x{:07X} - 0x{:07X} : {:>8} : Ver {}",
                range.offset,
                range.end(),
                range.name,
                range.version
            )?;
            loc = loc.max(range.end());
        }
        if loc < self.flash_size as u64 {
            writeln!(
                f,
                "0x{:07X} - 0x{:07X} : *******FREE*******",
                loc, self.flash_size
            )?;
        }
        write!(f, "{rule}")
    }
}
