// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
// Unsafe code lives in:
// - 'os/host.rs' maps fixed address ranges through libc and copies through raw pointers
// - 'os/fault.rs' installs signal handlers and reads registers out of ucontext_t
// - 'os/mod.rs' queries the page size
// - 'image/output.rs' and 'image/loader.rs' memory-map object files

//! # corespace
//!
//! The address-space foundation of a native-code Lisp runtime.
//!
//! The runtime's object representation and its copying collector assume that a handful of
//! memory regions ("spaces") live at fixed, architecture-specific virtual addresses. This crate
//! defines those regions, maps them at process start, turns hardware protection faults into
//! inspectable events, and packages a live heap into a standalone executable whose sections
//! load at exactly the same addresses.
//!
//! ## Components
//!
//! - [`layout`] - Per-architecture space layout tables (pure data)
//! - [`os`] - The OS shim: page size, protections, fixed mappings, fault handlers, registers
//! - [`space`] - The space validator and the live [`SpaceTable`]
//! - [`image`] - ELF core objects, external linker orchestration and core section loading
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Quick Start
//!
//! At runtime startup, before any allocation:
//!
//! ```rust,no_run
//! corespace::validate();
//!
//! let spaces = corespace::spaces().expect("validated above");
//! println!("current dynamic space: {}", spaces.current_dynamic_space());
//! ```
//!
//! ### Working against a simulated address space
//!
//! Every operation that touches memory goes through a [`os::VmBackend`]. The
//! [`os::SimulatedVm`] backend models an address space in-process, which is how the test suite
//! exercises validation, faults and image round-trips without reserving gigabytes of memory:
//!
//! ```rust
//! use corespace::prelude::*;
//!
//! let layout = layout(Architecture::Hppa);
//! let spaces = SpaceTable::validate_with(layout, Box::new(SimulatedVm::new()))?;
//! assert_eq!(spaces.current_dynamic_space(), SpaceId::Dynamic0);
//!
//! spaces.flip_dynamic_space();
//! assert_eq!(spaces.current_dynamic_space(), SpaceId::Dynamic1);
//! # Ok::<(), corespace::Error>(())
//! ```
//!
//! ### Saving an image
//!
//! ```rust,no_run
//! use corespace::image::{save_executable, LinkerConfig, SaveRequest};
//!
//! let spaces = corespace::spaces().expect("validated");
//! let request = SaveRequest::new("lisp.core.exe", std::env::temp_dir())
//!     .with_initial_function(0x2800_1000);
//! let config = LinkerConfig::default().with_runtime("/usr/lib/lisp/lisp.a");
//!
//! save_executable(spaces, &request, &config)?;
//! # Ok::<(), corespace::Error>(())
//! ```
//!
//! ## Build-time configuration
//!
//! - `linkage-table` feature - reserve the foreign-call linkage table where the architecture
//!   defines one
//! - `CORESPACE_DYNAMIC_SPACE_SIZE` - override the dynamic space size (hex or decimal)
//! - `CORESPACE_LINKAGE_SPACE_START` - override the linkage table base address
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types.
///
/// ```rust
/// use corespace::prelude::*;
///
/// let table = layout(Architecture::Sparc);
/// assert!(table.get(SpaceId::Static).is_some());
/// ```
pub mod prelude;

/// Per-architecture space layout tables.
///
/// See [`layout::layout`] for the lookup and [`layout::LayoutTable`] for the queries it
/// answers.
pub mod layout;

/// The operating system shim.
///
/// Page size, protection flags, the fixed-address mapping primitive behind
/// [`os::VmBackend`], the fault handler calling convention and the register accessor for the
/// faulting machine state.
pub mod os;

/// The space validator and the live space table.
pub mod space;

/// Core image objects, linking and loading.
pub mod image;

/// `corespace` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `corespace` Error type
///
/// ```rust
/// use corespace::{prelude::*, Error};
///
/// let vm = SimulatedVm::new();
/// vm.occupy(0x2800_0000, 0x1000);
///
/// match SpaceTable::validate_with(layout(Architecture::Hppa), Box::new(vm)) {
///     Err(Error::SpaceMapping { space, .. }) => assert_eq!(space, SpaceId::Static),
///     other => panic!("unexpected: {other:?}"),
/// }
/// ```
pub use error::{Error, FaultDeliveryError, MappingError, MappingErrorKind};

pub use layout::{layout, Architecture, LayoutTable, SpaceDescriptor, SpaceId};
pub use os::Protection;
pub use space::{current_dynamic_space, spaces, validate, FaultKind, SpaceTable};
