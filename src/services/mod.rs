pub mod analytics;
pub mod disk_store;
pub mod memory_store;
pub mod object_store;
pub mod pipeline;
pub mod retry;
pub mod sources;
pub mod sync_engine;
pub mod table_writer;
