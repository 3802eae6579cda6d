//! Library half of the `ep-server` binary, split out so integration tests
//! can exercise warmup and CLI parsing without shelling out to the process.

pub mod cli;
pub mod warmup;
