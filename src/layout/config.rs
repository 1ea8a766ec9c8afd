//! Build-time layout configuration.
//!
//! Architecture selection and the dynamic space size are decided when the runtime is built,
//! not by runtime flags. The two numeric knobs are read with `option_env!` and parsed in
//! `const` context, so a malformed value fails the build instead of the first startup.

use log::warn;

use super::{arch, Architecture, LayoutTable, SpaceDescriptor, SpaceId};
use crate::os::DEFAULT_PAGE_SIZE;

/// `CORESPACE_DYNAMIC_SPACE_SIZE` at build time, if set.
pub const DYNAMIC_SPACE_SIZE: Option<usize> = match option_env!("CORESPACE_DYNAMIC_SPACE_SIZE") {
    Some(value) => match parse_number(value.as_bytes()) {
        Some(size) => Some(size),
        None => panic!("CORESPACE_DYNAMIC_SPACE_SIZE must be a decimal or 0x-prefixed number"),
    },
    None => None,
};

/// `CORESPACE_LINKAGE_SPACE_START` at build time, if set.
pub const LINKAGE_SPACE_START: Option<usize> = match option_env!("CORESPACE_LINKAGE_SPACE_START")
{
    Some(value) => match parse_number(value.as_bytes()) {
        Some(start) if start % DEFAULT_PAGE_SIZE == 0 => Some(start),
        Some(_) => panic!("CORESPACE_LINKAGE_SPACE_START must be page aligned"),
        None => panic!("CORESPACE_LINKAGE_SPACE_START must be a decimal or 0x-prefixed number"),
    },
    None => None,
};

/// Parses a decimal or `0x`-prefixed hexadecimal number, allowing `_` separators.
const fn parse_number(bytes: &[u8]) -> Option<usize> {
    let (mut index, radix) = if bytes.len() > 2 && bytes[0] == b'0' && (bytes[1] | 0x20) == b'x' {
        (2, 16)
    } else {
        (0, 10)
    };

    if index >= bytes.len() {
        return None;
    }

    let mut value: usize = 0;
    while index < bytes.len() {
        let byte = bytes[index];
        index += 1;

        let digit = match byte {
            b'_' => continue,
            b'0'..=b'9' => (byte - b'0') as usize,
            b'a'..=b'f' if radix == 16 => (byte - b'a' + 10) as usize,
            b'A'..=b'F' if radix == 16 => (byte - b'A' + 10) as usize,
            _ => return None,
        };

        value = match value.checked_mul(radix) {
            Some(value) => value,
            None => return None,
        };
        value = match value.checked_add(digit) {
            Some(value) => value,
            None => return None,
        };
    }

    Some(value)
}

/// Options applied when a [`LayoutTable`] is built from the raw architecture constants.
///
/// [`LayoutOptions::default`] reflects the build configuration; [`LayoutOptions::new`] is the
/// same thing and exists for the builder style:
///
/// ```rust
/// use corespace::layout::{Architecture, LayoutOptions, SpaceId};
///
/// let table = LayoutOptions::new()
///     .with_linkage_table(true)
///     .with_dynamic_space_size(Some(0x0400_0000))
///     .build(Architecture::Sparc);
///
/// assert_eq!(table.dynamic_space_size(), 0x0400_0000);
/// assert!(table.get(SpaceId::ForeignLinkage).is_some());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutOptions {
    /// Keep the foreign linkage space where the architecture defines one
    pub linkage_table: bool,
    /// Size of each dynamic space; clamped to the architecture's slot
    pub dynamic_space_size: Option<usize>,
    /// Base address of the foreign linkage space
    pub linkage_space_start: Option<usize>,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        LayoutOptions {
            linkage_table: cfg!(feature = "linkage-table"),
            dynamic_space_size: DYNAMIC_SPACE_SIZE,
            linkage_space_start: LINKAGE_SPACE_START,
        }
    }
}

impl LayoutOptions {
    /// Options from the build configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables the foreign linkage space.
    #[must_use]
    pub fn with_linkage_table(mut self, enabled: bool) -> Self {
        self.linkage_table = enabled;
        self
    }

    /// Overrides the dynamic space size; `None` keeps the architecture default.
    #[must_use]
    pub fn with_dynamic_space_size(mut self, size: Option<usize>) -> Self {
        self.dynamic_space_size = size;
        self
    }

    /// Overrides the foreign linkage base address; `None` keeps the architecture default.
    #[must_use]
    pub fn with_linkage_space_start(mut self, start: Option<usize>) -> Self {
        self.linkage_space_start = start;
        self
    }

    /// Builds the layout table for `architecture`.
    ///
    /// A dynamic size override is rounded down to a page and clamped to the distance between
    /// the two dynamic bases, so the pair can never overlap; a zero override is ignored.
    ///
    /// A linkage base override is only applied if it is page aligned and the moved space
    /// stays clear of every other space. Otherwise it is ignored with a warning and the
    /// architecture default is kept.
    #[must_use]
    pub fn build(&self, architecture: Architecture) -> LayoutTable {
        let slot = arch::dynamic_slot(architecture);
        let dynamic_size = self
            .dynamic_space_size
            .map(|size| size.min(slot) & !(DEFAULT_PAGE_SIZE - 1))
            .filter(|size| *size > 0);

        let mut spaces: Vec<SpaceDescriptor> = arch::descriptors(architecture)
            .iter()
            .filter(|space| self.linkage_table || space.id != SpaceId::ForeignLinkage)
            .map(|space| {
                let mut space = *space;
                match dynamic_size {
                    Some(size) if space.id.is_dynamic() => space.size = size,
                    _ => {}
                }
                space
            })
            .collect();

        if let Some(start) = self.linkage_space_start {
            relocate_linkage(&mut spaces, start);
        }

        LayoutTable::new(architecture, spaces)
    }
}

/// Moves the foreign linkage space to `start` if it fits there.
fn relocate_linkage(spaces: &mut [SpaceDescriptor], start: usize) {
    let Some(index) = spaces
        .iter()
        .position(|space| space.id == SpaceId::ForeignLinkage)
    else {
        return;
    };

    let size = spaces[index].size;
    if start % DEFAULT_PAGE_SIZE != 0 {
        warn!("Ignoring unaligned foreign linkage base {start:#x}");
        return;
    }
    let Some(end) = start.checked_add(size) else {
        warn!("Ignoring foreign linkage base {start:#x}: space would wrap the address space");
        return;
    };

    if let Some(other) = spaces
        .iter()
        .filter(|space| space.id != SpaceId::ForeignLinkage)
        .find(|space| space.base < end && start < space.end())
    {
        warn!(
            "Ignoring foreign linkage base {start:#x}: {size:#x} bytes there overlap {} space",
            other.id
        );
        return;
    }

    spaces[index].base = start;
}
