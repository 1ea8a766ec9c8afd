//! # corespace Prelude
//!
//! The types most code touching the spaces needs: the layout lookup, the live table, the two
//! backends and the error type.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all corespace operations
pub use crate::Error;

/// The result type used throughout corespace
pub use crate::Result;

// ================================================================================================
// Layout
// ================================================================================================

/// Layout lookup and the types it answers with
pub use crate::layout::{layout, Architecture, LayoutOptions, LayoutTable, SpaceDescriptor, SpaceId};

// ================================================================================================
// Address space
// ================================================================================================

/// Page protection and the mapping backends
pub use crate::os::{HostVm, Protection, SimulatedVm, VmBackend};

/// The live space table and fault classification
pub use crate::space::{FaultKind, SpaceTable};
