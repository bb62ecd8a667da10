//! Host tool driving the extfs engine over disk image files.

pub mod args;
pub mod blockdev;
pub mod commands;
pub mod util;
