//! Reference iterative programs built on the runtime

pub mod connected_components;
