//! ELF relocatable objects carrying core sections.
//!
//! An [`ImageObject`] is a list of named sections, each with the virtual address it must be
//! loaded at and its bytes. It encodes as a minimal ELF relocatable object for the target
//! architecture: the ELF class and byte order follow [`Architecture::is_64bit`] and
//! [`Architecture::is_big_endian`], and `e_machine` follows [`Architecture::elf_machine`].
//!
//! # File layout
//!
//! ```text
//! +--------------------+ 0
//! | ELF header         |
//! +--------------------+
//! | .shstrtab          |
//! +--------------------+ word aligned
//! | section headers    | null, one per section, .note.GNU-stack, .shstrtab
//! +--------------------+ page aligned
//! | section payload    | one page aligned block per section
//! +--------------------+
//! ```
//!
//! Payloads start on a page boundary so the linker can place them at their page aligned
//! addresses without copying inside the file. The empty `.note.GNU-stack` section marks the
//! object as not needing an executable stack; without it GNU linkers assume one is required.

use std::path::{Path, PathBuf};

use goblin::elf::{
    header::{
        ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFDATA2MSB, ELFMAG, ET_REL, EV_CURRENT, SIZEOF_IDENT,
    },
    section_header::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_PROGBITS, SHT_STRTAB},
};
use log::debug;

use super::{
    io::{write_at, write_word_at, Endian},
    CoreSection, Output,
};
use crate::{layout::Architecture, os::DEFAULT_PAGE_SIZE, Error, Result, SpaceId, SpaceTable};

const SHSTRTAB: &str = ".shstrtab";
const GNU_STACK: &str = ".note.GNU-stack";

/// One section of an [`ImageObject`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSection {
    /// Section name, e.g. `CORSTA`
    pub name: String,
    /// Virtual address the section is loaded at
    pub address: u64,
    /// Section contents
    pub data: Vec<u8>,
}

/// Header and field sizes of one ELF class.
#[derive(Clone, Copy)]
struct Class {
    is_64bit: bool,
    endian: Endian,
}

impl Class {
    fn header_size(self) -> usize {
        if self.is_64bit {
            64
        } else {
            52
        }
    }

    fn section_header_size(self) -> usize {
        if self.is_64bit {
            64
        } else {
            40
        }
    }

    fn word_size(self) -> usize {
        if self.is_64bit {
            8
        } else {
            4
        }
    }
}

/// Where everything goes in the encoded file.
struct Plan {
    shstrtab: Vec<u8>,
    name_offsets: Vec<u32>,
    gnu_stack_name: u32,
    shstrtab_name: u32,
    shoff: usize,
    payloads: Vec<usize>,
    sizes: Vec<usize>,
    size: usize,
}

/// An ELF relocatable object made of core sections.
///
/// ```rust
/// use corespace::{image::ImageObject, Architecture};
///
/// let mut object = ImageObject::new(Architecture::Sparc);
/// object.push_section("CORSTA", 0x2800_0000, vec![0xab; 64]);
///
/// let bytes = object.encode()?;
/// assert_eq!(&bytes[..4], b"\x7fELF");
/// # Ok::<(), corespace::Error>(())
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageObject {
    architecture: Architecture,
    sections: Vec<ImageSection>,
}

impl ImageObject {
    /// An empty object for `architecture`.
    #[must_use]
    pub fn new(architecture: Architecture) -> Self {
        ImageObject {
            architecture,
            sections: Vec::new(),
        }
    }

    /// The target architecture.
    #[must_use]
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Appends a section loaded at `address`.
    pub fn push_section(&mut self, name: impl Into<String>, address: u64, data: Vec<u8>) {
        self.sections.push(ImageSection {
            name: name.into(),
            address,
            data,
        });
    }

    /// The sections in file order.
    #[must_use]
    pub fn sections(&self) -> &[ImageSection] {
        &self.sections
    }

    fn class(&self) -> Class {
        Class {
            is_64bit: self.architecture.is_64bit(),
            endian: if self.architecture.is_big_endian() {
                Endian::Big
            } else {
                Endian::Little
            },
        }
    }

    fn plan(&self) -> Result<Plan> {
        self.plan_sized(self.sections.iter().map(|section| section.data.len()).collect())
    }

    /// Lays the object out with the given payload size per section.
    fn plan_sized(&self, sizes: Vec<usize>) -> Result<Plan> {
        let class = self.class();
        debug_assert_eq!(sizes.len(), self.sections.len());

        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::with_capacity(self.sections.len());
        let mut intern = |name: &str| -> Result<u32> {
            let offset = u32::try_from(shstrtab.len()).map_err(|_| Error::OutOfBounds)?;
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
            Ok(offset)
        };

        for section in &self.sections {
            if section.name.is_empty() || section.name.contains('\0') {
                return Err(malformed_error!("Invalid section name {:?}", section.name));
            }
            if !class.is_64bit && u32::try_from(section.address).is_err() {
                return Err(malformed_error!(
                    "Section {} at {:#x} does not fit a 32-bit object",
                    section.name,
                    section.address
                ));
            }
            name_offsets.push(intern(&section.name)?);
        }
        let gnu_stack_name = intern(GNU_STACK)?;
        let shstrtab_name = intern(SHSTRTAB)?;

        let word = class.word_size();
        let shoff = (class.header_size() + shstrtab.len()).next_multiple_of(word);
        let mut cursor = shoff + (self.sections.len() + 3) * class.section_header_size();

        let mut payloads = Vec::with_capacity(sizes.len());
        for size in &sizes {
            cursor = cursor.next_multiple_of(DEFAULT_PAGE_SIZE);
            payloads.push(cursor);
            cursor = cursor.checked_add(*size).ok_or(Error::OutOfBounds)?;
        }

        Ok(Plan {
            shstrtab,
            name_offsets,
            gnu_stack_name,
            shstrtab_name,
            shoff,
            payloads,
            sizes,
            size: cursor,
        })
    }

    /// Size of the encoded object in bytes.
    ///
    /// # Errors
    ///
    /// Same as [`ImageObject::encode`].
    pub fn encoded_size(&self) -> Result<usize> {
        Ok(self.plan()?.size)
    }

    /// Encodes headers and string table into `out` and lets `fill` write each payload.
    fn encode_into<F>(&self, plan: &Plan, out: &mut [u8], mut fill: F) -> Result<()>
    where
        F: FnMut(&ImageSection, &mut [u8]) -> Result<()>,
    {
        let class = self.class();
        let Class { is_64bit, endian } = class;
        let shnum = u16::try_from(self.sections.len() + 3).map_err(|_| Error::OutOfBounds)?;

        // e_ident
        out.get_mut(..SIZEOF_IDENT).ok_or(Error::OutOfBounds)?.fill(0);
        out[..4].copy_from_slice(ELFMAG);
        out[4] = if is_64bit { ELFCLASS64 } else { ELFCLASS32 };
        out[5] = match endian {
            Endian::Little => ELFDATA2LSB,
            Endian::Big => ELFDATA2MSB,
        };
        out[6] = EV_CURRENT;

        let mut offset = SIZEOF_IDENT;
        write_at(out, &mut offset, ET_REL, endian)?;
        write_at(out, &mut offset, self.architecture.elf_machine(), endian)?;
        write_at(out, &mut offset, u32::from(EV_CURRENT), endian)?;
        write_word_at(out, &mut offset, 0, is_64bit, endian)?; // e_entry
        write_word_at(out, &mut offset, 0, is_64bit, endian)?; // e_phoff
        write_word_at(out, &mut offset, plan.shoff as u64, is_64bit, endian)?;
        write_at(out, &mut offset, 0u32, endian)?; // e_flags
        write_at(out, &mut offset, class.header_size() as u16, endian)?;
        write_at(out, &mut offset, 0u16, endian)?; // e_phentsize
        write_at(out, &mut offset, 0u16, endian)?; // e_phnum
        write_at(out, &mut offset, class.section_header_size() as u16, endian)?;
        write_at(out, &mut offset, shnum, endian)?;
        write_at(out, &mut offset, shnum - 1, endian)?; // e_shstrndx
        debug_assert_eq!(offset, class.header_size());

        let shstrtab_offset = class.header_size();
        out.get_mut(shstrtab_offset..shstrtab_offset + plan.shstrtab.len())
            .ok_or(Error::OutOfBounds)?
            .copy_from_slice(&plan.shstrtab);

        let mut offset = plan.shoff;
        out.get_mut(offset..offset + class.section_header_size())
            .ok_or(Error::OutOfBounds)?
            .fill(0);
        offset += class.section_header_size();

        let flags = u64::from(SHF_ALLOC | SHF_WRITE | SHF_EXECINSTR);
        for (((section, name), payload), size) in self
            .sections
            .iter()
            .zip(&plan.name_offsets)
            .zip(&plan.payloads)
            .zip(&plan.sizes)
        {
            let header = SectionHeader {
                name: *name,
                kind: SHT_PROGBITS,
                flags,
                address: section.address,
                offset: *payload as u64,
                size: *size as u64,
                align: DEFAULT_PAGE_SIZE as u64,
            };
            header.write(out, &mut offset, class)?;

            fill(
                section,
                out.get_mut(*payload..*payload + *size)
                    .ok_or(Error::OutOfBounds)?,
            )?;
        }

        let header = SectionHeader {
            name: plan.gnu_stack_name,
            kind: SHT_PROGBITS,
            flags: 0,
            address: 0,
            offset: plan.size as u64,
            size: 0,
            align: 1,
        };
        header.write(out, &mut offset, class)?;

        let header = SectionHeader {
            name: plan.shstrtab_name,
            kind: SHT_STRTAB,
            flags: 0,
            address: 0,
            offset: shstrtab_offset as u64,
            size: plan.shstrtab.len() as u64,
            align: 1,
        };
        header.write(out, &mut offset, class)
    }

    /// Encodes the object.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for an invalid section name or an address that does
    /// not fit a 32-bit object.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let plan = self.plan()?;
        let mut out = vec![0u8; plan.size];
        self.encode_into(&plan, &mut out, copy_payload)?;
        Ok(out)
    }

    /// Encodes the object straight into a file at `path`.
    ///
    /// The file is removed again if encoding fails.
    ///
    /// # Errors
    ///
    /// Same as [`ImageObject::encode`], plus [`crate::Error::WriteMmapFailed`] and
    /// [`crate::Error::WriteFinalizationFailed`] for output failures.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let plan = self.plan()?;
        self.write_planned(path, &plan, copy_payload)
    }

    fn write_planned<F>(&self, path: impl AsRef<Path>, plan: &Plan, fill: F) -> Result<()>
    where
        F: FnMut(&ImageSection, &mut [u8]) -> Result<()>,
    {
        let mut output = Output::create(path, plan.size as u64)?;
        self.encode_into(plan, output.as_mut_slice(), fill)?;

        debug!(
            "Wrote {} ({} bytes, {} sections)",
            output.target_path().display(),
            plan.size,
            self.sections.len()
        );
        output.finalize()
    }
}

fn copy_payload(section: &ImageSection, out: &mut [u8]) -> Result<()> {
    out.copy_from_slice(&section.data);
    Ok(())
}

struct SectionHeader {
    name: u32,
    kind: u32,
    flags: u64,
    address: u64,
    offset: u64,
    size: u64,
    align: u64,
}

impl SectionHeader {
    fn write(&self, out: &mut [u8], offset: &mut usize, class: Class) -> Result<()> {
        let Class { is_64bit, endian } = class;

        write_at(out, offset, self.name, endian)?;
        write_at(out, offset, self.kind, endian)?;
        write_word_at(out, offset, self.flags, is_64bit, endian)?;
        write_word_at(out, offset, self.address, is_64bit, endian)?;
        write_word_at(out, offset, self.offset, is_64bit, endian)?;
        write_word_at(out, offset, self.size, is_64bit, endian)?;
        write_at(out, offset, 0u32, endian)?; // sh_link
        write_at(out, offset, 0u32, endian)?; // sh_info
        write_word_at(out, offset, self.align, is_64bit, endian)?;
        write_word_at(out, offset, 0, is_64bit, endian) // sh_entsize
    }
}

/// Writes `[low, high)` of `space` as a core object into `dir`.
///
/// The object holds one core section loaded at `low` and is named after it, e.g.
/// `CORSTA.o` for static space. The space contents are read straight into the mapped output
/// file. Returns the path of the written object.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if `space` has no core section or is not in the layout,
/// [`crate::Error::NotMapped`] if the range does not lie inside the space, and the output
/// errors of [`ImageObject::write_to`].
pub fn write_image_object(
    spaces: &SpaceTable,
    dir: impl AsRef<Path>,
    space: SpaceId,
    low: usize,
    high: usize,
) -> Result<PathBuf> {
    let section = CoreSection::for_space(space)
        .ok_or_else(|| malformed_error!("{} space has no core section", space))?;
    let descriptor = spaces
        .descriptor(space)
        .ok_or_else(|| malformed_error!("{} space is not part of the layout", space))?;

    let len = high.checked_sub(low).ok_or(Error::NotMapped {
        address: low,
        len: 0,
    })?;
    if !descriptor.contains_range(low, len) {
        return Err(Error::NotMapped { address: low, len });
    }

    let mut object = ImageObject::new(spaces.architecture());
    object.push_section(section.name(), low as u64, Vec::new());
    let plan = object.plan_sized(vec![len])?;

    let path = dir.as_ref().join(section.file_name());
    object.write_planned(&path, &plan, |_, out| {
        if out.is_empty() {
            Ok(())
        } else {
            spaces.read(low, out)
        }
    })?;
    Ok(path)
}
