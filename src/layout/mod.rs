//! Per-architecture space layout tables.
//!
//! The runtime's tagged pointers, the collector and the saved images all assume that every
//! space sits at the same virtual address in every process built for a given architecture. This
//! module is the single source of those addresses: a pure lookup from an [`Architecture`] to
//! an ordered [`LayoutTable`] of [`SpaceDescriptor`]s.
//!
//! # Key Components
//!
//! - [`SpaceId`] - The closed set of spaces the runtime knows about
//! - [`SpaceDescriptor`] - Base address, size and initial protection of one space
//! - [`LayoutTable`] - The ordered descriptors for one architecture
//! - [`LayoutOptions`] - Build-time knobs: linkage table, dynamic space size, linkage base
//! - [`layout`] - The lookup itself, honouring the build configuration
//!
//! # Table order
//!
//! Tables are ordered the way the validator maps them: read-only, static, both dynamic
//! spaces, the three stacks and finally the foreign linkage table. Diagnostics name the first
//! space that fails, so the order is part of the contract.
//!
//! # Examples
//!
//! ```rust
//! use corespace::layout::{layout, Architecture, SpaceId};
//!
//! let table = layout(Architecture::Hppa);
//! let static_space = table.get(SpaceId::Static).unwrap();
//! assert_eq!(static_space.base, 0x2800_0000);
//! assert_eq!(static_space.size, 0x0800_0000);
//! assert!(table.overlaps().is_none());
//! ```

mod arch;
mod config;

pub use config::LayoutOptions;

use std::{fmt, ops::Range};

use strum::{Display, EnumCount, EnumIter, EnumString, FromRepr, IntoStaticStr};

use crate::os::Protection;

/// Identifies one of the fixed spaces.
///
/// The discriminant is stable and is what the live [`crate::SpaceTable`] stores in its atomic
/// `current_dynamic_space` slot.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Debug,
    PartialOrd,
    Ord,
    EnumIter,
    EnumCount,
    Display,
    IntoStaticStr,
    FromRepr,
)]
#[repr(u8)]
pub enum SpaceId {
    /// Immutable code and constants; writable only while an image is built or loaded.
    #[strum(serialize = "read-only")]
    ReadOnly = 0,
    /// Objects that never move: symbols, the static roots of the collector.
    #[strum(serialize = "static")]
    Static = 1,
    /// First half of the copying collector's semispace pair.
    #[strum(serialize = "dynamic-0")]
    Dynamic0 = 2,
    /// Second half of the copying collector's semispace pair.
    #[strum(serialize = "dynamic-1")]
    Dynamic1 = 3,
    /// The Lisp control stack.
    #[strum(serialize = "control-stack")]
    ControlStack = 4,
    /// The dynamic binding stack.
    #[strum(serialize = "binding-stack")]
    BindingStack = 5,
    /// The auxiliary stack for unboxed numbers.
    #[strum(serialize = "number-stack")]
    NumberStack = 6,
    /// Linkage table used to call into foreign code.
    #[strum(serialize = "foreign-linkage")]
    ForeignLinkage = 7,
}

impl SpaceId {
    /// Returns `true` for the two semispaces of the copying collector.
    #[must_use]
    pub fn is_dynamic(self) -> bool {
        matches!(self, SpaceId::Dynamic0 | SpaceId::Dynamic1)
    }

    /// Returns `true` for the spaces that get a guard page at their overflow end.
    #[must_use]
    pub fn is_guarded_stack(self) -> bool {
        matches!(self, SpaceId::ControlStack | SpaceId::BindingStack)
    }

    /// The other half of the dynamic pair, or `None` for non-dynamic spaces.
    #[must_use]
    pub fn dynamic_partner(self) -> Option<SpaceId> {
        match self {
            SpaceId::Dynamic0 => Some(SpaceId::Dynamic1),
            SpaceId::Dynamic1 => Some(SpaceId::Dynamic0),
            _ => None,
        }
    }
}

/// Target architectures with a known space layout.
///
/// The layout is selected once at build time through [`Architecture::host`]; the other
/// variants stay available so images and layouts for other targets can be inspected.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Debug, EnumIter, EnumCount, Display, EnumString, IntoStaticStr,
)]
pub enum Architecture {
    /// 32-bit x86.
    #[strum(serialize = "x86")]
    X86,
    /// 64-bit x86.
    #[strum(serialize = "x86_64")]
    X86_64,
    /// 64-bit ARM.
    #[strum(serialize = "aarch64")]
    Aarch64,
    /// 32-bit PowerPC.
    #[strum(serialize = "ppc")]
    Ppc,
    /// 32-bit SPARC.
    #[strum(serialize = "sparc")]
    Sparc,
    /// 32-bit PA-RISC.
    #[strum(serialize = "hppa")]
    Hppa,
}

impl Architecture {
    /// The architecture this crate was built for.
    ///
    /// Hosts without a dedicated table fall back to the `x86_64` layout, whose addresses sit
    /// in the low 4 GB and are free on every demand-paged 64-bit system.
    #[must_use]
    pub const fn host() -> Architecture {
        if cfg!(target_arch = "x86") {
            Architecture::X86
        } else if cfg!(target_arch = "aarch64") {
            Architecture::Aarch64
        } else if cfg!(target_arch = "powerpc") {
            Architecture::Ppc
        } else if cfg!(target_arch = "sparc") {
            Architecture::Sparc
        } else {
            Architecture::X86_64
        }
    }

    /// Whether native words are 64 bits wide.
    #[must_use]
    pub const fn is_64bit(self) -> bool {
        matches!(self, Architecture::X86_64 | Architecture::Aarch64)
    }

    /// Whether the target stores words most significant byte first.
    #[must_use]
    pub const fn is_big_endian(self) -> bool {
        matches!(
            self,
            Architecture::Ppc | Architecture::Sparc | Architecture::Hppa
        )
    }

    /// The ELF `e_machine` value for this target.
    #[must_use]
    pub const fn elf_machine(self) -> u16 {
        use goblin::elf::header::{EM_386, EM_AARCH64, EM_PARISC, EM_PPC, EM_SPARC, EM_X86_64};

        match self {
            Architecture::X86 => EM_386,
            Architecture::X86_64 => EM_X86_64,
            Architecture::Aarch64 => EM_AARCH64,
            Architecture::Ppc => EM_PPC,
            Architecture::Sparc => EM_SPARC,
            Architecture::Hppa => EM_PARISC,
        }
    }
}

/// One fixed space: where it lives, how big it is and how it starts out protected.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SpaceDescriptor {
    /// Which space this is
    pub id: SpaceId,
    /// Page aligned base address
    pub base: usize,
    /// Size in bytes
    pub size: usize,
    /// Protection the validator maps it with
    pub protection: Protection,
}

impl SpaceDescriptor {
    /// Creates a new descriptor.
    #[must_use]
    pub const fn new(id: SpaceId, base: usize, size: usize, protection: Protection) -> Self {
        SpaceDescriptor {
            id,
            base,
            size,
            protection,
        }
    }

    /// One past the last address of the space.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.size
    }

    /// The address range `[base, end)`.
    #[must_use]
    pub const fn range(&self) -> Range<usize> {
        self.base..self.end()
    }

    /// Returns `true` if `address` lies inside the space.
    #[must_use]
    pub const fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end()
    }

    /// Returns `true` if `[address, address + len)` lies entirely inside the space.
    #[must_use]
    pub fn contains_range(&self, address: usize, len: usize) -> bool {
        match address.checked_add(len) {
            Some(end) => address >= self.base && end <= self.end(),
            None => false,
        }
    }

    /// Returns `true` if the two spaces share at least one address.
    #[must_use]
    pub const fn overlaps(&self, other: &SpaceDescriptor) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// The guard page at the overflow end of a stack space.
    ///
    /// Stacks grow towards higher addresses, so the guard is the last page of the space.
    /// Returns `None` for spaces without a guard and for stacks smaller than two pages.
    #[must_use]
    pub fn guard_page(&self, page_size: usize) -> Option<Range<usize>> {
        if !self.id.is_guarded_stack() || self.size < 2 * page_size {
            return None;
        }

        let start = (self.end() - page_size) & !(page_size - 1);
        Some(start..start + page_size)
    }
}

impl fmt::Display for SpaceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} {:#010x}..{:#010x} {:>6} MB {}",
            self.id,
            self.base,
            self.end(),
            self.size >> 20,
            self.protection
        )
    }
}

/// The ordered space descriptors of one architecture.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LayoutTable {
    architecture: Architecture,
    spaces: Vec<SpaceDescriptor>,
}

impl LayoutTable {
    /// Creates a layout table from explicit descriptors, kept in the given order.
    ///
    /// Used for custom layouts; [`layout`] is the normal way to get one.
    #[must_use]
    pub fn new(architecture: Architecture, spaces: Vec<SpaceDescriptor>) -> Self {
        LayoutTable {
            architecture,
            spaces,
        }
    }

    /// The architecture this table belongs to.
    #[must_use]
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// All descriptors in mapping order.
    #[must_use]
    pub fn spaces(&self) -> &[SpaceDescriptor] {
        &self.spaces
    }

    /// Iterates over the descriptors in mapping order.
    pub fn iter(&self) -> std::slice::Iter<'_, SpaceDescriptor> {
        self.spaces.iter()
    }

    /// Looks up a space by id.
    #[must_use]
    pub fn get(&self, id: SpaceId) -> Option<&SpaceDescriptor> {
        self.spaces.iter().find(|space| space.id == id)
    }

    /// Finds the space containing `address`.
    ///
    /// This is the classification the collector relies on to tell heap, stack and code
    /// addresses apart.
    #[must_use]
    pub fn space_containing(&self, address: usize) -> Option<&SpaceDescriptor> {
        self.spaces.iter().find(|space| space.contains(address))
    }

    /// Size of each dynamic space, or 0 if the table has none.
    #[must_use]
    pub fn dynamic_space_size(&self) -> usize {
        self.get(SpaceId::Dynamic0).map_or(0, |space| space.size)
    }

    /// Returns the first pair of overlapping spaces, if any.
    #[must_use]
    pub fn overlaps(&self) -> Option<(SpaceId, SpaceId)> {
        for (index, first) in self.spaces.iter().enumerate() {
            for second in &self.spaces[index + 1..] {
                if first.overlaps(second) {
                    return Some((first.id, second.id));
                }
            }
        }

        None
    }
}

impl<'a> IntoIterator for &'a LayoutTable {
    type Item = &'a SpaceDescriptor;
    type IntoIter = std::slice::Iter<'a, SpaceDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.spaces.iter()
    }
}

/// Returns the layout of `architecture` under the build-time configuration.
///
/// The `linkage-table` feature decides whether the foreign linkage space is present;
/// `CORESPACE_DYNAMIC_SPACE_SIZE` and `CORESPACE_LINKAGE_SPACE_START` are applied when they
/// were set at build time.
#[must_use]
pub fn layout(architecture: Architecture) -> LayoutTable {
    LayoutOptions::default().build(architecture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    const PAGE: usize = 4096;

    fn all_layouts() -> Vec<LayoutTable> {
        let mut tables = Vec::new();
        for arch in Architecture::iter() {
            tables.push(LayoutOptions::new().with_linkage_table(false).build(arch));
            tables.push(LayoutOptions::new().with_linkage_table(true).build(arch));
        }
        tables
    }

    #[test]
    fn test_no_overlap_for_any_architecture() {
        for table in all_layouts() {
            assert_eq!(
                table.overlaps(),
                None,
                "{} layout has overlapping spaces",
                table.architecture()
            );
        }
    }

    #[test]
    fn test_bases_page_aligned() {
        for table in all_layouts() {
            for space in &table {
                assert_eq!(
                    space.base % PAGE,
                    0,
                    "{} {} base not page aligned",
                    table.architecture(),
                    space.id
                );
                assert!(space.size > 0);
            }
        }
    }

    #[test]
    fn test_dynamic_pair_equal() {
        for table in all_layouts() {
            let first = table.get(SpaceId::Dynamic0).unwrap();
            let second = table.get(SpaceId::Dynamic1).unwrap();
            assert_eq!(first.size, second.size);
            assert_eq!(table.dynamic_space_size(), first.size);
        }
    }

    #[test]
    fn test_mapping_order() {
        let table = layout(Architecture::Hppa);
        let order: Vec<SpaceId> = table.iter().map(|space| space.id).collect();
        assert_eq!(
            &order[..4],
            &[
                SpaceId::ReadOnly,
                SpaceId::Static,
                SpaceId::Dynamic0,
                SpaceId::Dynamic1
            ]
        );
    }

    #[test]
    fn test_iter_reversed() {
        let table = layout(Architecture::Hppa);
        let forward: Vec<SpaceId> = table.iter().map(|space| space.id).collect();
        let mut backward: Vec<SpaceId> = table.iter().rev().map(|space| space.id).collect();
        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(table.iter().len(), table.spaces().len());
    }

    #[test]
    fn test_hppa_constants() {
        let table = LayoutOptions::new()
            .with_dynamic_space_size(None)
            .build(Architecture::Hppa);

        let read_only = table.get(SpaceId::ReadOnly).unwrap();
        assert_eq!(read_only.base, 0x2000_0000);
        assert_eq!(read_only.size, 0x0800_0000);

        let static_space = table.get(SpaceId::Static).unwrap();
        assert_eq!(static_space.base, 0x2800_0000);
        assert_eq!(read_only.end(), static_space.base);
        assert!(!read_only.overlaps(static_space));

        assert_eq!(table.get(SpaceId::Dynamic1).unwrap().base, 0x3800_0000);
        assert!(table.get(SpaceId::ForeignLinkage).is_none());
    }

    #[test]
    fn test_linkage_space_gated() {
        let without = LayoutOptions::new()
            .with_linkage_table(false)
            .build(Architecture::Sparc);
        assert!(without.get(SpaceId::ForeignLinkage).is_none());

        let with = LayoutOptions::new()
            .with_linkage_table(true)
            .build(Architecture::Sparc);
        let linkage = with.get(SpaceId::ForeignLinkage).unwrap();
        let read_only = with.get(SpaceId::ReadOnly).unwrap();
        assert!(!linkage.overlaps(read_only));
        assert_eq!(with.spaces().last().unwrap().id, SpaceId::ForeignLinkage);
    }

    #[test]
    fn test_space_containing() {
        let table = layout(Architecture::Hppa);
        assert_eq!(
            table.space_containing(0x2800_0010).map(|s| s.id),
            Some(SpaceId::Static)
        );
        assert_eq!(
            table.space_containing(0x27ff_ffff).map(|s| s.id),
            Some(SpaceId::ReadOnly)
        );
        assert!(table.space_containing(0x1000).is_none());
    }

    #[test]
    fn test_guard_page() {
        let table = layout(Architecture::Hppa);
        let control = table.get(SpaceId::ControlStack).unwrap();
        let guard = control.guard_page(PAGE).unwrap();
        assert_eq!(guard.end, control.end());
        assert_eq!(guard.len(), PAGE);

        let static_space = table.get(SpaceId::Static).unwrap();
        assert!(static_space.guard_page(PAGE).is_none());
    }

    #[test]
    fn test_contains_range() {
        let space = SpaceDescriptor::new(SpaceId::Static, 0x1000, 0x2000, Protection::ALL);
        assert!(space.contains_range(0x1000, 0x2000));
        assert!(!space.contains_range(0x1000, 0x2001));
        assert!(!space.contains_range(0x0fff, 1));
        assert!(!space.contains_range(usize::MAX, 2));
    }

    #[test]
    fn test_space_id_names() {
        assert_eq!(SpaceId::ReadOnly.to_string(), "read-only");
        assert_eq!(SpaceId::Dynamic1.to_string(), "dynamic-1");
        assert_eq!(SpaceId::from_repr(5), Some(SpaceId::BindingStack));
        assert_eq!(SpaceId::Dynamic0.dynamic_partner(), Some(SpaceId::Dynamic1));
        assert_eq!(SpaceId::Static.dynamic_partner(), None);
    }

    #[test]
    fn test_architecture_parse() {
        assert_eq!("ppc".parse::<Architecture>().unwrap(), Architecture::Ppc);
        assert_eq!(
            "x86_64".parse::<Architecture>().unwrap(),
            Architecture::X86_64
        );
        assert!("vax".parse::<Architecture>().is_err());
        assert!(Architecture::Sparc.is_big_endian());
        assert!(!Architecture::X86.is_64bit());
    }
}
