pub mod check;
pub mod common;
pub mod inspect;
pub mod layout;
pub mod probe;
