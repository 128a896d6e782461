//! Control plane: serialized operations and their event journal

pub mod events;
pub mod surface;
