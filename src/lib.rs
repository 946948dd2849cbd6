mod core;

pub use crate::core::{cmd, container, error, handle, network, StatePaths, ROOT_PATH};
