#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod aggregate;
pub mod api;
pub mod container;
pub mod executor;
pub mod io;
pub mod planner;
pub mod regress;
pub mod store;
pub mod types;

pub use api::{Engine, EngineError, resident_memory, size_of};
pub use types::{ChunkRange, DType, Partition, Shape};
