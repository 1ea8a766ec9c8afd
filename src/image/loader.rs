//! Mapping the core sections of a built executable back into the spaces.
//!
//! At startup a runtime that was saved as an executable finds its heap inside its own binary.
//! [`map_core_sections`] memory-maps the file, looks the core sections up by name and copies
//! each one to its address in the live spaces. The section addresses were chosen by the image
//! build from the same layout, so every section has to lie inside the space it belongs to;
//! anything else is a binary built for another layout and is rejected.
//!
//! The same works on an unlinked core object, which is how the round trip is tested.

use std::{fs::File, path::Path};

use goblin::elf::{section_header::SHT_NOBITS, Elf, SectionHeader};
use log::debug;
use memmap2::Mmap;

use super::{linker::INITIAL_FUNCTION_SYMBOL, CoreSection};
use crate::{Error, Result, SpaceTable};

/// A core section copied into a space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadedSection {
    /// Which core section
    pub section: CoreSection,
    /// Where it was loaded
    pub address: usize,
    /// Its size in bytes
    pub size: usize,
}

/// What [`map_core_sections`] found in a binary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoreImage {
    /// The loaded sections in file order
    pub sections: Vec<LoadedSection>,
    /// Value of the `initial_function_addr` symbol, if the binary defines it
    pub initial_function: Option<u64>,
}

fn open(path: &Path) -> Result<Mmap> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}

fn core_sections<'a>(elf: &'a Elf<'_>) -> Vec<(CoreSection, &'a SectionHeader)> {
    elf.section_headers
        .iter()
        .filter_map(|header| {
            let name = elf.shdr_strtab.get_at(header.sh_name)?;
            CoreSection::from_name(name).map(|section| (section, header))
        })
        .collect()
}

/// Rejects a binary built for another architecture than the one `spaces` was laid out for.
fn check_target(spaces: &SpaceTable, elf: &Elf<'_>) -> Result<()> {
    let architecture = spaces.architecture();

    if elf.is_64 != architecture.is_64bit()
        || elf.little_endian == architecture.is_big_endian()
        || elf.header.e_machine != architecture.elf_machine()
    {
        return Err(malformed_error!(
            "Binary is a {}-bit {} endian object for machine {}, expected {}",
            if elf.is_64 { 64 } else { 32 },
            if elf.little_endian { "little" } else { "big" },
            elf.header.e_machine,
            architecture
        ));
    }
    Ok(())
}

/// Copies the core sections of the binary at `path` into `spaces`.
///
/// Every section is checked before the first byte is copied, so a rejected binary leaves the
/// spaces untouched. A dynamic section that lies in the non-current dynamic space makes that
/// space current.
///
/// # Errors
///
/// Returns [`Error::FileError`] or [`Error::GoblinErr`] if the binary cannot be read or
/// parsed, [`Error::Malformed`] if it targets another architecture or a section does not lie
/// inside its space, and [`Error::OutOfBounds`] if a section claims bytes past the end of the
/// file.
pub fn map_core_sections(spaces: &SpaceTable, path: impl AsRef<Path>) -> Result<CoreImage> {
    let path = path.as_ref();
    let mmap = open(path)?;
    let elf = Elf::parse(&mmap)?;
    check_target(spaces, &elf)?;

    let mut planned = Vec::new();
    for (section, header) in core_sections(&elf) {
        let address = usize::try_from(header.sh_addr).map_err(|_| Error::OutOfBounds)?;
        let size = usize::try_from(header.sh_size).map_err(|_| Error::OutOfBounds)?;

        let space = spaces
            .layout()
            .iter()
            .find(|space| section.holds(space.id) && space.contains_range(address, size))
            .ok_or_else(|| {
                malformed_error!(
                    "{} section at {:#x}+{:#x} lies outside its space",
                    section,
                    address,
                    size
                )
            })?;

        let data = if header.sh_type != SHT_NOBITS && size > 0 {
            let start = usize::try_from(header.sh_offset).map_err(|_| Error::OutOfBounds)?;
            start
                .checked_add(size)
                .and_then(|end| mmap.get(start..end))
                .ok_or(Error::OutOfBounds)?
        } else {
            &[]
        };

        planned.push((section, space.id, address, size, data));
    }

    let mut image = CoreImage::default();
    for (section, id, address, size, data) in planned {
        if !data.is_empty() {
            spaces.write(address, data)?;
        }

        if id.is_dynamic() && id != spaces.current_dynamic_space() {
            spaces.set_current_dynamic_space(id);
        }

        debug!("Loaded {section} ({size:#x} bytes) into {id} space at {address:#x}");
        image.sections.push(LoadedSection {
            section,
            address,
            size,
        });
    }

    image.initial_function = elf
        .syms
        .iter()
        .find(|sym| elf.strtab.get_at(sym.st_name) == Some(INITIAL_FUNCTION_SYMBOL))
        .map(|sym| sym.st_value);

    Ok(image)
}

/// Returns `true` if the binary at `path` carries at least one core section.
///
/// # Errors
///
/// Returns [`Error::FileError`] or [`Error::GoblinErr`] if the file cannot be read or is not
/// ELF.
pub fn has_core_sections(path: impl AsRef<Path>) -> Result<bool> {
    let mmap = open(path.as_ref())?;
    let elf = Elf::parse(&mmap)?;
    let found = !core_sections(&elf).is_empty();
    Ok(found)
}

/// Lists the core sections of the binary at `path` without loading them.
///
/// # Errors
///
/// Same as [`has_core_sections`].
pub fn list_core_sections(path: impl AsRef<Path>) -> Result<Vec<LoadedSection>> {
    let mmap = open(path.as_ref())?;
    let elf = Elf::parse(&mmap)?;

    core_sections(&elf)
        .into_iter()
        .map(|(section, header)| {
            Ok(LoadedSection {
                section,
                address: usize::try_from(header.sh_addr).map_err(|_| Error::OutOfBounds)?,
                size: usize::try_from(header.sh_size).map_err(|_| Error::OutOfBounds)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        image::ImageObject,
        layout::{Architecture, LayoutOptions},
        os::SimulatedVm,
        SpaceId,
    };
    use tempfile::tempdir;

    fn table() -> SpaceTable {
        SpaceTable::validate_with(
            LayoutOptions::new()
                .with_dynamic_space_size(None)
                .build(Architecture::Hppa),
            Box::new(SimulatedVm::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_load_into_spaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("image.o");

        let mut object = ImageObject::new(Architecture::Hppa);
        object.push_section("CORSTA", 0x2800_0100, b"static bytes".to_vec());
        object.push_section("CORDYN", 0x3800_0000, b"dynamic".to_vec());
        object.write_to(&path).unwrap();

        let spaces = table();
        let image = map_core_sections(&spaces, &path).unwrap();
        assert_eq!(image.sections.len(), 2);
        assert_eq!(image.initial_function, None);

        let mut buf = [0u8; 12];
        spaces.read(0x2800_0100, &mut buf).unwrap();
        assert_eq!(&buf, b"static bytes");

        // Dynamic section lies in dynamic-1, which becomes current
        assert_eq!(spaces.current_dynamic_space(), SpaceId::Dynamic1);
        assert!(has_core_sections(&path).unwrap());
    }

    #[test]
    fn test_section_outside_space_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.o");

        // Static section placed in read-only space
        let mut object = ImageObject::new(Architecture::Hppa);
        object.push_section("CORSTA", 0x2000_0000, vec![1; 16]);
        object.write_to(&path).unwrap();

        assert!(matches!(
            map_core_sections(&table(), &path),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_other_architecture_rejected() {
        let dir = tempdir().unwrap();

        // Same addresses and byte order, different machine
        let sparc = dir.path().join("sparc.o");
        let mut object = ImageObject::new(Architecture::Sparc);
        object.push_section("CORSTA", 0x2800_0100, vec![1; 16]);
        object.write_to(&sparc).unwrap();

        // Different class and byte order
        let wide = dir.path().join("x86_64.o");
        let mut object = ImageObject::new(Architecture::X86_64);
        object.push_section("CORSTA", 0x2800_0100, vec![1; 16]);
        object.write_to(&wide).unwrap();

        let spaces = table();
        for path in [&sparc, &wide] {
            assert!(matches!(
                map_core_sections(&spaces, path),
                Err(Error::Malformed { .. })
            ));
        }

        let mut buf = [0xffu8; 16];
        spaces.read(0x2800_0100, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_rejected_binary_loads_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("half.o");

        // A good static section followed by a read-only section outside its space
        let mut object = ImageObject::new(Architecture::Hppa);
        object.push_section("CORSTA", 0x2800_0000, b"new static".to_vec());
        object.push_section("CORDYN", 0x3800_0000, b"new dynamic".to_vec());
        object.push_section("CORRO", 0x2800_1000, vec![2; 16]);
        object.write_to(&path).unwrap();

        let spaces = table();
        spaces.write(0x2800_0000, b"old static").unwrap();

        assert!(matches!(
            map_core_sections(&spaces, &path),
            Err(Error::Malformed { .. })
        ));

        let mut buf = [0u8; 10];
        spaces.read(0x2800_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"old static");
        assert_eq!(spaces.current_dynamic_space(), SpaceId::Dynamic0);
    }

    #[test]
    fn test_no_core_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.o");

        let mut object = ImageObject::new(Architecture::Hppa);
        object.push_section(".text", 0x1000, vec![0; 4]);
        object.write_to(&path).unwrap();

        assert!(!has_core_sections(&path).unwrap());
        assert!(list_core_sections(&path).unwrap().is_empty());
    }

    #[test]
    fn test_not_elf() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage");
        std::fs::write(&path, b"definitely not an ELF file").unwrap();

        assert!(has_core_sections(&path).is_err());
    }
}
