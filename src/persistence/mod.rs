//! Run and candle persistence
//!
//! `RunRepository` is the storage contract. `MemoryStore` keeps everything in
//! process; the PostgreSQL implementation lives in `adapters::postgres`.

pub mod memory;
mod repository;

pub use memory::MemoryStore;
pub use repository::RunRepository;
