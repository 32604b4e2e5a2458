//! Pure wire codec: no I/O, no shared mutable state.

pub mod frame;
pub mod payload;
