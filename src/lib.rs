use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod annotation;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod imaging;
pub mod loader;
pub mod shard;
pub mod text;
pub mod training;
