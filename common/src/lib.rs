pub mod common;
pub mod error;
pub mod pprof;
