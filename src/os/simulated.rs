//! Simulated address space backend.
//!
//! [`SimulatedVm`] models an address space inside the process. Each mapped region carries a
//! default protection and a set of lazily materialized pages; [`VmBackend::protect`] records
//! per-page protection overrides on top of the region default, the same way `mprotect` splits
//! a mapping on a real host. A half-gigabyte dynamic space costs nothing until pages are
//! written, so whole architecture layouts can be validated in tests and dry runs.
//!
//! # Protection
//!
//! Unlike the host, a forbidden access does not raise a signal; it returns
//! [`crate::Error::ProtectionViolation`] with the first offending address, which callers can
//! feed into [`crate::SpaceTable::classify_fault`] exactly like a real fault address. A write
//! is checked across its whole range before any byte lands.
//!
//! # Thread Safety
//!
//! Regions, overrides and the foreign reservations sit behind separate `RwLock`s. Clones share
//! the same address space, so a test can keep a handle for inspection after moving one into a
//! [`crate::SpaceTable`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use super::{Protection, VmBackend, DEFAULT_PAGE_SIZE};
use crate::{Error, MappingError, MappingErrorKind, Result};

/// One page of simulated memory, zero until first written.
#[derive(Debug, Clone)]
struct Page {
    data: Box<[u8]>,
}

impl Page {
    fn zeroed(page_size: usize) -> Self {
        Page {
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// A mapped range with its default protection.
///
/// Pages are keyed by their page-aligned address so a region can be split without
/// renumbering them.
#[derive(Debug)]
struct Region {
    base: usize,
    size: usize,
    protection: Protection,
    pages: HashMap<usize, Page>,
}

impl Region {
    fn end(&self) -> usize {
        self.base + self.size
    }

    fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end()
    }

    fn contains_range(&self, address: usize, len: usize) -> bool {
        match address.checked_add(len) {
            Some(end) => address >= self.base && end <= self.end(),
            None => false,
        }
    }

    fn overlaps(&self, address: usize, end: usize) -> bool {
        self.base < end && address < self.end()
    }

    /// The part of the region inside `[start, end)`, with the pages that fall into it.
    fn slice(&self, start: usize, end: usize) -> Option<Region> {
        let start = start.max(self.base);
        let end = end.min(self.end());
        if start >= end {
            return None;
        }

        let pages = self
            .pages
            .iter()
            .filter(|(page, _)| (start..end).contains(*page))
            .map(|(page, contents)| (*page, contents.clone()))
            .collect();

        Some(Region {
            base: start,
            size: end - start,
            protection: self.protection,
            pages,
        })
    }

    fn read(&self, address: usize, buf: &mut [u8], page_size: usize) {
        let mut bytes_read = 0;
        while bytes_read < buf.len() {
            let current = address + bytes_read;
            let page = current & !(page_size - 1);
            let page_offset = current - page;
            let bytes_in_page = (page_size - page_offset).min(buf.len() - bytes_read);
            let target = &mut buf[bytes_read..bytes_read + bytes_in_page];

            match self.pages.get(&page) {
                Some(contents) => contents.read(page_offset, target),
                None => target.fill(0),
            }
            bytes_read += bytes_in_page;
        }
    }

    fn write(&mut self, address: usize, bytes: &[u8], page_size: usize) {
        let mut bytes_written = 0;
        while bytes_written < bytes.len() {
            let current = address + bytes_written;
            let page = current & !(page_size - 1);
            let page_offset = current - page;
            let bytes_in_page = (page_size - page_offset).min(bytes.len() - bytes_written);

            self.pages
                .entry(page)
                .or_insert_with(|| Page::zeroed(page_size))
                .write(page_offset, &bytes[bytes_written..bytes_written + bytes_in_page]);
            bytes_written += bytes_in_page;
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    regions: RwLock<Vec<Region>>,
    /// Page-aligned address to protection, set by `protect`; absent means the region default
    protection_overrides: RwLock<HashMap<usize, Protection>>,
    /// Ranges held by some other allocation
    occupied: RwLock<Vec<(usize, usize)>>,
    attempts: Mutex<Vec<usize>>,
}

/// An in-process model of a demand-paged address space.
#[derive(Debug, Clone)]
pub struct SimulatedVm {
    page_size: usize,
    inner: Arc<Inner>,
}

impl Default for SimulatedVm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedVm {
    /// Creates an empty address space with 4 KB pages.
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Creates an empty address space with the given page size (a power of two).
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        SimulatedVm {
            page_size,
            inner: Arc::new(Inner::default()),
        }
    }

    /// Marks a range as taken by some other allocation, so mapping over it fails.
    pub fn occupy(&self, address: usize, size: usize) {
        write_lock!(self.inner.occupied).push((address, size));
    }

    /// Returns `true` if `address` lies inside a region mapped through this backend.
    #[must_use]
    pub fn is_mapped(&self, address: usize) -> bool {
        read_lock!(self.inner.regions)
            .iter()
            .any(|region| region.contains(address))
    }

    /// The `(base, size)` of every mapped region in address order.
    #[must_use]
    pub fn mapped_ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges: Vec<(usize, usize)> = read_lock!(self.inner.regions)
            .iter()
            .map(|region| (region.base, region.size))
            .collect();
        ranges.sort_unstable();
        ranges
    }

    /// The base address of every `map` request so far, successful or not, in call order.
    #[must_use]
    pub fn map_attempts(&self) -> Vec<usize> {
        lock!(self.inner.attempts).clone()
    }

    /// The protection of the page containing `address`, if mapped.
    ///
    /// A protection override on the page wins over the region's default.
    #[must_use]
    pub fn protection_at(&self, address: usize) -> Option<Protection> {
        let page = address & !(self.page_size - 1);
        if let Some(protection) = read_lock!(self.inner.protection_overrides).get(&page) {
            return Some(*protection);
        }

        read_lock!(self.inner.regions)
            .iter()
            .find(|region| region.contains(address))
            .map(|region| region.protection)
    }

    fn check_aligned(&self, address: usize, size: usize) -> std::result::Result<usize, MappingError> {
        match address.checked_add(size) {
            Some(end) if address % self.page_size == 0 && size > 0 => Ok(end),
            _ => Err(MappingError::new(
                address,
                size,
                MappingErrorKind::Unaligned {
                    page_size: self.page_size,
                },
            )),
        }
    }

    /// Returns the first address in `[address, address + len)` whose page lacks `required`.
    fn first_violation(
        &self,
        region: &Region,
        address: usize,
        len: usize,
        required: Protection,
    ) -> Option<usize> {
        let overrides = read_lock!(self.inner.protection_overrides);
        let mut page = address & !(self.page_size - 1);

        while page < address + len {
            let protection = overrides.get(&page).copied().unwrap_or(region.protection);
            if !protection.contains(required) {
                return Some(page.max(address));
            }
            page += self.page_size;
        }

        None
    }
}

impl VmBackend for SimulatedVm {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> std::result::Result<(), MappingError> {
        lock!(self.inner.attempts).push(address);

        let end = self.check_aligned(address, size)?;
        let mut regions = write_lock!(self.inner.regions);

        let taken = regions.iter().any(|region| region.overlaps(address, end))
            || read_lock!(self.inner.occupied)
                .iter()
                .any(|(base, len)| *base < end && address < base + len);
        if taken {
            return Err(MappingError::new(address, size, MappingErrorKind::InUse));
        }

        regions.push(Region {
            base: address,
            size,
            protection,
            pages: HashMap::new(),
        });
        Ok(())
    }

    fn unmap(&self, address: usize, size: usize) -> std::result::Result<(), MappingError> {
        let end = self.check_aligned(address, size)?;
        let mut regions = write_lock!(self.inner.regions);

        if !regions.iter().any(|region| region.overlaps(address, end)) {
            return Err(MappingError::new(
                address,
                size,
                MappingErrorKind::NotMapped,
            ));
        }

        // Keep whatever lies outside the released range, like munmap splitting a mapping
        let mut kept = Vec::with_capacity(regions.len() + 1);
        for region in regions.drain(..) {
            if !region.overlaps(address, end) {
                kept.push(region);
                continue;
            }

            let (base, region_end) = (region.base, region.end());
            kept.extend(region.slice(base, address));
            kept.extend(region.slice(end, region_end));
        }
        *regions = kept;

        write_lock!(self.inner.protection_overrides).retain(|page, _| !(address..end).contains(page));
        Ok(())
    }

    fn protect(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> std::result::Result<(), MappingError> {
        let end = self.check_aligned(address, size)?;
        let regions = read_lock!(self.inner.regions);

        let Some(region) = regions
            .iter()
            .find(|region| region.contains_range(address, size))
        else {
            return Err(MappingError::new(
                address,
                size,
                MappingErrorKind::NotMapped,
            ));
        };

        let mut overrides = write_lock!(self.inner.protection_overrides);
        let mut page = address;
        while page < end {
            if protection == region.protection {
                overrides.remove(&page);
            } else {
                overrides.insert(page, protection);
            }
            page += self.page_size;
        }
        Ok(())
    }

    fn read(&self, address: usize, buf: &mut [u8]) -> Result<()> {
        let regions = read_lock!(self.inner.regions);
        let Some(region) = regions
            .iter()
            .find(|region| region.contains_range(address, buf.len()))
        else {
            return Err(Error::NotMapped {
                address,
                len: buf.len(),
            });
        };

        if let Some(violation) = self.first_violation(region, address, buf.len(), Protection::READ) {
            return Err(Error::ProtectionViolation { address: violation });
        }

        region.read(address, buf, self.page_size);
        Ok(())
    }

    fn write(&self, address: usize, data: &[u8]) -> Result<()> {
        let mut regions = write_lock!(self.inner.regions);
        let Some(region) = regions
            .iter_mut()
            .find(|region| region.contains_range(address, data.len()))
        else {
            return Err(Error::NotMapped {
                address,
                len: data.len(),
            });
        };

        if let Some(violation) = self.first_violation(region, address, data.len(), Protection::WRITE)
        {
            return Err(Error::ProtectionViolation { address: violation });
        }

        region.write(address, data, self.page_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_pages_read_zero() {
        let vm = SimulatedVm::new();
        vm.map(0x1000_0000, 0x1000_0000, Protection::ALL).unwrap();

        let mut buf = [0xffu8; 16];
        vm.read(0x1800_0000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_write_across_pages() {
        let vm = SimulatedVm::new();
        vm.map(0x4000, 0x4000, Protection::ALL).unwrap();

        let data: Vec<u8> = (0..=255).cycle().take(6000).collect();
        vm.write(0x4ff0, &data).unwrap();

        let mut back = vec![0u8; data.len()];
        vm.read(0x4ff0, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_out_of_region() {
        let vm = SimulatedVm::new();
        vm.map(0x4000, 0x1000, Protection::ALL).unwrap();

        assert!(matches!(
            vm.write(0x4ff0, &[0u8; 32]),
            Err(Error::NotMapped { .. })
        ));
        assert!(matches!(
            vm.read(0x9000, &mut [0u8; 1]),
            Err(Error::NotMapped { .. })
        ));
    }

    #[test]
    fn test_occupied_and_overlapping() {
        let vm = SimulatedVm::new();
        vm.occupy(0x2800_0000, 0x1000);

        let error = vm
            .map(0x2000_0000, 0x1000_0000, Protection::ALL)
            .unwrap_err();
        assert!(matches!(error.kind, MappingErrorKind::InUse));

        vm.map(0x1000, 0x2000, Protection::ALL).unwrap();
        assert!(vm.map(0x2000, 0x1000, Protection::ALL).is_err());
        assert_eq!(vm.map_attempts(), vec![0x2000_0000, 0x1000, 0x2000]);
    }

    #[test]
    fn test_protect_traps_writes() {
        let vm = SimulatedVm::new();
        vm.map(0x10000, 0x4000, Protection::ALL).unwrap();
        vm.protect(0x12000, 0x2000, Protection::READ).unwrap();

        assert_eq!(vm.protection_at(0x10000), Some(Protection::ALL));
        assert_eq!(vm.protection_at(0x12fff), Some(Protection::READ));

        vm.write(0x11ff0, &[1u8; 16]).unwrap();
        match vm.write(0x11ff8, &[2u8; 16]) {
            Err(Error::ProtectionViolation { address }) => assert_eq!(address, 0x12000),
            other => panic!("expected a protection violation, got {other:?}"),
        }

        // Nothing from the failed write landed
        let mut buf = [0u8; 8];
        vm.read(0x11ff8, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 8]);
    }

    #[test]
    fn test_protect_back_to_default_drops_override() {
        let vm = SimulatedVm::new();
        vm.map(0x10000, 0x4000, Protection::ALL).unwrap();

        vm.protect(0x10000, 0x4000, Protection::READ).unwrap();
        assert_eq!(read_lock!(vm.inner.protection_overrides).len(), 4);

        vm.protect(0x10000, 0x4000, Protection::ALL).unwrap();
        assert!(read_lock!(vm.inner.protection_overrides).is_empty());
        vm.write(0x13ff8, &[1u8; 8]).unwrap();
    }

    #[test]
    fn test_protect_none_traps_reads() {
        let vm = SimulatedVm::new();
        vm.map(0x10000, 0x2000, Protection::ALL).unwrap();
        vm.protect(0x11000, 0x1000, Protection::NONE).unwrap();

        assert!(matches!(
            vm.read(0x11000, &mut [0u8; 1]),
            Err(Error::ProtectionViolation { address: 0x11000 })
        ));
    }

    #[test]
    fn test_unmap() {
        let vm = SimulatedVm::new();
        vm.map(0x10000, 0x2000, Protection::ALL).unwrap();
        assert!(vm.is_mapped(0x11fff));

        vm.unmap(0x10000, 0x2000).unwrap();
        assert!(!vm.is_mapped(0x10000));
        assert!(vm.unmap(0x10000, 0x2000).is_err());
        assert!(vm.mapped_ranges().is_empty());
    }

    #[test]
    fn test_partial_unmap_splits_region() {
        let vm = SimulatedVm::new();
        vm.map(0x10000, 0x4000, Protection::ALL).unwrap();
        vm.write(0x10000, b"head").unwrap();
        vm.write(0x13000, b"tail").unwrap();

        vm.unmap(0x11000, 0x2000).unwrap();
        assert_eq!(vm.mapped_ranges(), vec![(0x10000, 0x1000), (0x13000, 0x1000)]);
        assert!(!vm.is_mapped(0x11000));
        assert!(!vm.is_mapped(0x12fff));

        let mut buf = [0u8; 4];
        vm.read(0x13000, &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
        vm.read(0x10000, &mut buf).unwrap();
        assert_eq!(&buf, b"head");
    }

    #[test]
    fn test_clones_share_state() {
        let vm = SimulatedVm::new();
        let handle = vm.clone();
        vm.map(0x10000, 0x1000, Protection::ALL).unwrap();
        assert_eq!(handle.mapped_ranges(), vec![(0x10000, 0x1000)]);
    }
}
