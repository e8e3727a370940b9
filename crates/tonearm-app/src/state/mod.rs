//! Application state management.

pub mod controls;

pub use controls::ControlsState;
