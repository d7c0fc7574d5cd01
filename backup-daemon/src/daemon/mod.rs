//! Process-level plumbing for the long-running `schedule` mode.

pub mod shutdown;
