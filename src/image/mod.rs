//! Core image objects, linking and loading.
//!
//! A saved image is an ordinary executable: the runtime, linked with three extra sections
//! holding the contents of read-only, static and the current dynamic space. The sections are
//! placed at the addresses the spaces occupy in the layout, so at startup they can be copied
//! back without relocating a single pointer.
//!
//! # Key Components
//!
//! - [`CoreSection`] - The three core sections: `CORRO`, `CORSTA` and `CORDYN`
//! - [`ImageObject`] / [`write_image_object`] - ELF relocatable objects carrying core sections
//! - [`run_linker`] / [`LinkerConfig`] - Driving the external linker
//! - [`BuildArtifacts`] / [`cleanup`] - Removing intermediate files on every exit path
//! - [`map_core_sections`] - Copying the sections of a built executable into the spaces
//! - [`save_executable`] - The whole save: objects, placement script, link, cleanup
//!
//! # Saving
//!
//! ```rust,no_run
//! use corespace::{
//!     image::{save_executable, CoreSection, LinkerConfig, SaveRequest},
//!     prelude::*,
//! };
//!
//! let spaces = SpaceTable::validate_with(layout(Architecture::host()), Box::new(HostVm::new()))?;
//! let request = SaveRequest::new("lisp.exe", std::env::temp_dir())
//!     .with_free_pointer(CoreSection::Dynamic, 0x4010_0000);
//!
//! save_executable(&spaces, &request, &LinkerConfig::default())?;
//! # Ok::<(), corespace::Error>(())
//! ```

mod artifacts;
mod io;
mod linker;
mod loader;
mod object;
mod output;

pub use artifacts::{cleanup, BuildArtifacts, LINKER_SCRIPT};
pub use io::Endian;
pub use linker::{
    linker_command, placement_script, run_linker, write_placement_script, LinkInvocation,
    LinkerConfig, INITIAL_FUNCTION_SYMBOL,
};
pub use loader::{has_core_sections, list_core_sections, map_core_sections, CoreImage, LoadedSection};
pub use object::{write_image_object, ImageObject, ImageSection};
pub use output::Output;

use std::path::PathBuf;

use log::info;
use strum::{Display, EnumIter, IntoStaticStr};

use crate::{layout::SpaceId, Result, SpaceTable};

/// The sections a saved image consists of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, Display, IntoStaticStr)]
pub enum CoreSection {
    /// Contents of read-only space
    #[strum(serialize = "CORRO")]
    ReadOnly,
    /// Contents of static space
    #[strum(serialize = "CORSTA")]
    Static,
    /// Contents of the current dynamic space
    #[strum(serialize = "CORDYN")]
    Dynamic,
}

impl CoreSection {
    /// The section name in the object and the executable.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// The object file the section is written to, e.g. `CORSTA.o`.
    #[must_use]
    pub fn file_name(self) -> String {
        format!("{}.o", self.name())
    }

    /// Looks a section up by its name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<CoreSection> {
        match name {
            "CORRO" => Some(CoreSection::ReadOnly),
            "CORSTA" => Some(CoreSection::Static),
            "CORDYN" => Some(CoreSection::Dynamic),
            _ => None,
        }
    }

    /// The section holding the contents of `space`, if it is saved at all.
    #[must_use]
    pub fn for_space(space: SpaceId) -> Option<CoreSection> {
        match space {
            SpaceId::ReadOnly => Some(CoreSection::ReadOnly),
            SpaceId::Static => Some(CoreSection::Static),
            SpaceId::Dynamic0 | SpaceId::Dynamic1 => Some(CoreSection::Dynamic),
            _ => None,
        }
    }

    /// Returns `true` if the section may be loaded into `space`.
    #[must_use]
    pub fn holds(self, space: SpaceId) -> bool {
        CoreSection::for_space(space) == Some(self)
    }
}

/// What to save and where.
///
/// Each core section is written from the base of its space up to its free pointer; a section
/// without a free pointer covers the whole space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveRequest {
    /// The executable to produce
    pub output: PathBuf,
    /// Directory for the intermediate objects and the placement script
    pub work_dir: PathBuf,
    /// Entry point of the saved image
    pub initial_function: Option<u64>,
    /// End of the used part of read-only space
    pub read_only_free: Option<usize>,
    /// End of the used part of static space
    pub static_free: Option<usize>,
    /// End of the used part of the current dynamic space
    pub dynamic_free: Option<usize>,
}

impl SaveRequest {
    /// Saves to `output`, using `work_dir` for intermediate files.
    #[must_use]
    pub fn new(output: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        SaveRequest {
            output: output.into(),
            work_dir: work_dir.into(),
            initial_function: None,
            read_only_free: None,
            static_free: None,
            dynamic_free: None,
        }
    }

    /// Sets the entry point of the saved image.
    #[must_use]
    pub fn with_initial_function(mut self, address: u64) -> Self {
        self.initial_function = Some(address);
        self
    }

    /// Sets the free pointer of one section's space.
    #[must_use]
    pub fn with_free_pointer(mut self, section: CoreSection, address: usize) -> Self {
        let slot = match section {
            CoreSection::ReadOnly => &mut self.read_only_free,
            CoreSection::Static => &mut self.static_free,
            CoreSection::Dynamic => &mut self.dynamic_free,
        };
        *slot = Some(address);
        self
    }

    fn free_pointer(&self, section: CoreSection) -> Option<usize> {
        match section {
            CoreSection::ReadOnly => self.read_only_free,
            CoreSection::Static => self.static_free,
            CoreSection::Dynamic => self.dynamic_free,
        }
    }
}

/// Saves the live spaces as a standalone executable.
///
/// Writes one core object per section into the work directory, writes the placement script,
/// runs the linker and returns the output path. The intermediate files are removed on every
/// path out of this function, including a failed link, unless
/// [`LinkerConfig::keep_artifacts`] is set.
///
/// # Errors
///
/// Returns the errors of [`write_image_object`], [`write_placement_script`] and
/// [`run_linker`].
pub fn save_executable(
    spaces: &SpaceTable,
    request: &SaveRequest,
    config: &LinkerConfig,
) -> Result<PathBuf> {
    let mut artifacts = BuildArtifacts::new(&request.work_dir).with_keep(config.keep_artifacts);
    let mut invocation = LinkInvocation::new(&request.output)
        .with_initial_function(request.initial_function);
    let mut placements = Vec::new();

    let saved = [
        (CoreSection::ReadOnly, SpaceId::ReadOnly),
        (CoreSection::Static, SpaceId::Static),
        (CoreSection::Dynamic, spaces.current_dynamic_space()),
    ];

    for (section, space) in saved {
        let Some(descriptor) = spaces.descriptor(space) else {
            continue;
        };

        let high = request.free_pointer(section).unwrap_or(descriptor.end());
        let path = write_image_object(spaces, &request.work_dir, space, descriptor.base, high)?;
        artifacts.push(&path);
        invocation = invocation.with_object(path);
        placements.push((section, descriptor.base as u64));
    }

    let script = write_placement_script(&request.work_dir, &placements)?;
    artifacts.push(&script);
    let invocation = invocation.with_script(script);

    run_linker(config, &invocation)?;
    info!("Saved image to {}", request.output.display());
    Ok(request.output.clone())
}
