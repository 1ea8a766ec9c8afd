//! The raw per-architecture address constants.
//!
//! Heaps are mapped with every permission because compiled code lives in them; stacks are
//! data only. The foreign linkage table is listed last and is dropped by
//! [`super::LayoutOptions`] unless the linkage table is enabled.

use super::{Architecture, SpaceDescriptor, SpaceId};
use crate::os::Protection;

const HEAP: Protection = Protection::ALL;
const STACK: Protection = Protection::READ.union(Protection::WRITE);

macro_rules! space {
    ($id:ident, $base:expr, $size:expr, $protection:expr) => {
        SpaceDescriptor::new(SpaceId::$id, $base, $size, $protection)
    };
}

const X86: &[SpaceDescriptor] = &[
    space!(ReadOnly, 0x1000_0000, 0x0800_0000, HEAP),
    space!(Static, 0x1800_0000, 0x0800_0000, HEAP),
    space!(Dynamic0, 0x3000_0000, 0x2000_0000, HEAP),
    space!(Dynamic1, 0x5000_0000, 0x2000_0000, HEAP),
    space!(ControlStack, 0x2100_0000, 0x0200_0000, STACK),
    space!(BindingStack, 0x2300_0000, 0x0100_0000, STACK),
    space!(NumberStack, 0x2400_0000, 0x0100_0000, STACK),
    space!(ForeignLinkage, 0x2000_0000, 0x0080_0000, HEAP),
];

const X86_64: &[SpaceDescriptor] = &[
    space!(ReadOnly, 0x1000_0000, 0x1000_0000, HEAP),
    space!(Static, 0x2000_0000, 0x1000_0000, HEAP),
    space!(Dynamic0, 0x4000_0000, 0x2000_0000, HEAP),
    space!(Dynamic1, 0x6000_0000, 0x2000_0000, HEAP),
    space!(ControlStack, 0x3100_0000, 0x0800_0000, STACK),
    space!(BindingStack, 0x3900_0000, 0x0400_0000, STACK),
    space!(NumberStack, 0x3d00_0000, 0x0200_0000, STACK),
    space!(ForeignLinkage, 0x3000_0000, 0x0080_0000, HEAP),
];

const AARCH64: &[SpaceDescriptor] = &[
    space!(ReadOnly, 0x0400_0000, 0x0800_0000, HEAP),
    space!(Static, 0x0c00_0000, 0x0800_0000, HEAP),
    space!(Dynamic0, 0x2000_0000, 0x2000_0000, HEAP),
    space!(Dynamic1, 0x4000_0000, 0x2000_0000, HEAP),
    space!(ControlStack, 0x1500_0000, 0x0400_0000, STACK),
    space!(BindingStack, 0x1900_0000, 0x0100_0000, STACK),
    space!(NumberStack, 0x1a00_0000, 0x0100_0000, STACK),
    space!(ForeignLinkage, 0x1400_0000, 0x0080_0000, HEAP),
];

// Read-only space stays in the low 64 MB reachable by a 26-bit branch, since assembly
// routines are entered with a direct branch.
const PPC: &[SpaceDescriptor] = &[
    space!(ReadOnly, 0x0100_0000, 0x07ff_8000, HEAP),
    space!(Static, 0x1000_0000, 0x07ff_8000, HEAP),
    space!(Dynamic0, 0x4000_0000, 0x1fff_0000, HEAP),
    space!(Dynamic1, 0x6000_0000, 0x1fff_0000, HEAP),
    space!(ControlStack, 0x3000_0000, 0x07ff_8000, STACK),
    space!(BindingStack, 0x3800_0000, 0x07ff_8000, STACK),
    space!(NumberStack, 0x2000_0000, 0x0010_0000, STACK),
    space!(ForeignLinkage, 0x0a00_0000, 0x0080_0000, HEAP),
];

const SPARC: &[SpaceDescriptor] = &[
    space!(ReadOnly, 0x1000_0000, 0x0fff_0000, HEAP),
    space!(Static, 0x2800_0000, 0x0fff_0000, HEAP),
    space!(Dynamic0, 0x4000_0000, 0x1fff_0000, HEAP),
    space!(Dynamic1, 0x6000_0000, 0x1fff_0000, HEAP),
    space!(ControlStack, 0x2000_0000, 0x07ff_0000, STACK),
    space!(BindingStack, 0x3800_0000, 0x07ff_0000, STACK),
    space!(NumberStack, 0x8000_0000, 0x0010_0000, STACK),
    // 8 MB of 16-byte entries, about 510K foreign symbols; must end below read-only space
    space!(ForeignLinkage, 0x0f80_0000, 0x0080_0000, HEAP),
];

const HPPA: &[SpaceDescriptor] = &[
    space!(ReadOnly, 0x2000_0000, 0x0800_0000, HEAP),
    space!(Static, 0x2800_0000, 0x0800_0000, HEAP),
    space!(Dynamic0, 0x3000_0000, 0x0800_0000, HEAP),
    space!(Dynamic1, 0x3800_0000, 0x0800_0000, HEAP),
    space!(ControlStack, 0x5000_0000, 0x0010_0000, STACK),
    space!(BindingStack, 0x7000_0000, 0x0010_0000, STACK),
    space!(NumberStack, 0x6000_0000, 0x0010_0000, STACK),
];

/// The unconfigured descriptors for `architecture`, in mapping order.
pub(super) fn descriptors(architecture: Architecture) -> &'static [SpaceDescriptor] {
    match architecture {
        Architecture::X86 => X86,
        Architecture::X86_64 => X86_64,
        Architecture::Aarch64 => AARCH64,
        Architecture::Ppc => PPC,
        Architecture::Sparc => SPARC,
        Architecture::Hppa => HPPA,
    }
}

/// Distance between the two dynamic bases: the largest dynamic space the layout can hold.
pub(super) fn dynamic_slot(architecture: Architecture) -> usize {
    let spaces = descriptors(architecture);
    let base = |id| {
        spaces
            .iter()
            .find(|space| space.id == id)
            .map_or(0, |space| space.base)
    };

    base(SpaceId::Dynamic1).saturating_sub(base(SpaceId::Dynamic0))
}
