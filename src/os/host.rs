//! Host address space backend.
//!
//! [`HostVm`] maps spaces into the real process address space with anonymous, private
//! mappings. Fixed placement is requested without clobbering anything already there:
//!
//! - Linux/Android: `MAP_FIXED_NOREPLACE`, the kernel answers `EEXIST` for occupied ranges
//! - FreeBSD: `MAP_FIXED | MAP_EXCL`
//! - elsewhere: the address is only a hint and the result is checked
//!
//! In every case a mapping that did not land at the requested address is released again and
//! reported as [`MappingErrorKind::Relocated`]; the backend never hands out a relocated space.
//!
//! Large spaces are mapped with `MAP_NORESERVE` where available, so reserving half a gigabyte
//! of dynamic space costs no memory until it is touched.

use std::{collections::BTreeMap, io, ptr, sync::Mutex};

use log::debug;

use super::{Protection, VmBackend};
use crate::{Error, MappingError, MappingErrorKind, Result};

#[cfg(any(target_os = "linux", target_os = "android"))]
const FIXED_FLAGS: libc::c_int = libc::MAP_FIXED_NOREPLACE | libc::MAP_NORESERVE;

#[cfg(target_os = "freebsd")]
const FIXED_FLAGS: libc::c_int = libc::MAP_FIXED | libc::MAP_EXCL;

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const FIXED_FLAGS: libc::c_int = 0;

/// The real process address space.
///
/// Keeps a record of the ranges it mapped so `read` and `write` only ever touch memory this
/// backend owns. A write into a page whose protection forbids it raises the host's
/// protection-violation signal, which is exactly how guard pages and the GC trigger work.
#[derive(Debug)]
pub struct HostVm {
    page_size: usize,
    regions: Mutex<BTreeMap<usize, usize>>,
}

impl Default for HostVm {
    fn default() -> Self {
        Self::new()
    }
}

impl HostVm {
    /// Creates a backend for the current process.
    #[must_use]
    pub fn new() -> Self {
        HostVm {
            page_size: super::page_size(),
            regions: Mutex::new(BTreeMap::new()),
        }
    }

    fn check_aligned(&self, address: usize, size: usize) -> std::result::Result<(), MappingError> {
        if address % self.page_size != 0 || size == 0 || address.checked_add(size).is_none() {
            return Err(MappingError::new(
                address,
                size,
                MappingErrorKind::Unaligned {
                    page_size: self.page_size,
                },
            ));
        }
        Ok(())
    }

    /// Returns `true` if `[address, address + len)` lies inside one recorded mapping.
    fn owns(&self, address: usize, len: usize) -> bool {
        let Some(end) = address.checked_add(len) else {
            return false;
        };

        with_lock!(self.regions, |regions: &mut BTreeMap<usize, usize>| {
            regions
                .range(..=address)
                .next_back()
                .is_some_and(|(base, size)| end <= base + size)
        })
    }
}

impl VmBackend for HostVm {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> std::result::Result<(), MappingError> {
        self.check_aligned(address, size)?;

        let result = unsafe {
            libc::mmap(
                address as *mut libc::c_void,
                size,
                protection.to_native(),
                libc::MAP_PRIVATE | libc::MAP_ANON | FIXED_FLAGS,
                -1,
                0,
            )
        };

        if result == libc::MAP_FAILED {
            let error = io::Error::last_os_error();
            let kind = if error.raw_os_error() == Some(libc::EEXIST) {
                MappingErrorKind::InUse
            } else {
                MappingErrorKind::Os(error)
            };
            return Err(MappingError::new(address, size, kind));
        }

        if result as usize != address {
            // Kernels without fixed-noreplace support treat the address as a hint
            unsafe {
                libc::munmap(result, size);
            }
            return Err(MappingError::new(
                address,
                size,
                MappingErrorKind::Relocated {
                    actual: result as usize,
                },
            ));
        }

        lock!(self.regions).insert(address, size);
        debug!("mapped {size:#x} bytes at {address:#x} ({protection})");
        Ok(())
    }

    fn unmap(&self, address: usize, size: usize) -> std::result::Result<(), MappingError> {
        self.check_aligned(address, size)?;

        if unsafe { libc::munmap(address as *mut libc::c_void, size) } != 0 {
            return Err(MappingError::new(
                address,
                size,
                MappingErrorKind::Os(io::Error::last_os_error()),
            ));
        }

        // Keep the parts of any record outside the released range
        let end = address + size;
        let mut regions = lock!(self.regions);
        let overlapping: Vec<(usize, usize)> = regions
            .range(..end)
            .filter(|(base, len)| *base + *len > address)
            .map(|(base, len)| (*base, *len))
            .collect();
        for (base, len) in overlapping {
            regions.remove(&base);
            if base < address {
                regions.insert(base, address - base);
            }
            if base + len > end {
                regions.insert(end, base + len - end);
            }
        }
        drop(regions);

        debug!("unmapped {size:#x} bytes at {address:#x}");
        Ok(())
    }

    fn protect(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> std::result::Result<(), MappingError> {
        self.check_aligned(address, size)?;

        if !self.owns(address, size) {
            return Err(MappingError::new(
                address,
                size,
                MappingErrorKind::NotMapped,
            ));
        }

        self.protect_unchecked(address, size, protection)
    }

    fn protect_unchecked(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> std::result::Result<(), MappingError> {
        let result = unsafe {
            libc::mprotect(
                address as *mut libc::c_void,
                size,
                protection.to_native(),
            )
        };
        if result != 0 {
            return Err(MappingError::new(
                address,
                size,
                MappingErrorKind::Os(io::Error::last_os_error()),
            ));
        }

        Ok(())
    }

    fn read(&self, address: usize, buf: &mut [u8]) -> Result<()> {
        if !self.owns(address, buf.len()) {
            return Err(Error::NotMapped {
                address,
                len: buf.len(),
            });
        }

        unsafe {
            ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&self, address: usize, data: &[u8]) -> Result<()> {
        if !self.owns(address, data.len()) {
            return Err(Error::NotMapped {
                address,
                len: data.len(),
            });
        }

        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // High in the address space, away from the binary, heap and shared libraries
    #[cfg(target_pointer_width = "64")]
    const BASE: usize = 0x40_0000_0000;
    #[cfg(not(target_pointer_width = "64"))]
    const BASE: usize = 0x7600_0000;

    #[test]
    fn test_map_write_read_unmap() {
        let vm = HostVm::new();
        let size = vm.page_size() * 4;
        let address = BASE;

        vm.map(address, size, Protection::READ | Protection::WRITE)
            .unwrap();
        vm.write(address + 8, &[0xde, 0xad, 0xbe, 0xef]).unwrap();

        let mut buf = [0u8; 4];
        vm.read(address + 8, &mut buf).unwrap();
        assert_eq!(buf, [0xde, 0xad, 0xbe, 0xef]);

        vm.unmap(address, size).unwrap();
        assert!(matches!(
            vm.read(address, &mut buf),
            Err(Error::NotMapped { .. })
        ));
    }

    #[test]
    fn test_map_occupied_range_fails() {
        let vm = HostVm::new();
        let size = vm.page_size() * 2;
        let address = BASE + 0x100_0000;

        vm.map(address, size, Protection::ALL).unwrap();
        let error = vm.map(address, size, Protection::ALL).unwrap_err();
        assert_eq!(error.address, address);
        assert_eq!(error.size, size);
        assert!(matches!(
            error.kind,
            MappingErrorKind::InUse | MappingErrorKind::Relocated { .. }
        ));

        vm.unmap(address, size).unwrap();
    }

    #[test]
    fn test_map_unaligned_rejected() {
        let vm = HostVm::new();
        let error = vm.map(BASE + 1, vm.page_size(), Protection::ALL).unwrap_err();
        assert!(matches!(error.kind, MappingErrorKind::Unaligned { .. }));
    }

    #[test]
    fn test_partial_unmap_keeps_the_rest() {
        let vm = HostVm::new();
        let page = vm.page_size();
        let address = BASE + 0x300_0000;

        vm.map(address, 4 * page, Protection::READ | Protection::WRITE)
            .unwrap();
        vm.write(address, &[7u8; 8]).unwrap();
        vm.unmap(address + page, 2 * page).unwrap();

        let mut buf = [0u8; 8];
        vm.read(address, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 8]);
        vm.read(address + 3 * page, &mut buf).unwrap();
        assert!(matches!(
            vm.read(address + page, &mut buf),
            Err(Error::NotMapped { .. })
        ));
        assert!(matches!(
            vm.read(address + page - 4, &mut buf),
            Err(Error::NotMapped { .. })
        ));
        assert!(vm.protect(address + page, page, Protection::NONE).is_err());

        vm.unmap(address, page).unwrap();
        vm.unmap(address + 3 * page, page).unwrap();
        assert!(lock!(vm.regions).is_empty());
    }

    #[test]
    fn test_protect_unchecked_takes_no_lock() {
        let vm = HostVm::new();
        let page = vm.page_size();
        let address = BASE + 0x400_0000;
        vm.map(address, 2 * page, Protection::ALL).unwrap();

        {
            // A fault handler may interrupt a thread that holds the bookkeeping lock
            let _held = lock!(vm.regions);
            vm.protect_unchecked(address, page, Protection::READ).unwrap();
            vm.protect_unchecked(address, page, Protection::ALL).unwrap();
        }

        vm.write(address, &[1u8; 4]).unwrap();
        vm.unmap(address, 2 * page).unwrap();
    }

    #[test]
    fn test_protect_unowned_rejected() {
        let vm = HostVm::new();
        let error = vm
            .protect(BASE + 0x200_0000, vm.page_size(), Protection::NONE)
            .unwrap_err();
        assert!(matches!(error.kind, MappingErrorKind::NotMapped));
    }
}
