//! Bindings between the local editor and the shared document.

pub mod document;
pub mod unit;

pub use document::{DocumentBinding, EXECUTION_SETTLE_DELAY};
pub use unit::UnitBinding;
