//! Process lifecycle: signal handling.

pub mod shutdown;
