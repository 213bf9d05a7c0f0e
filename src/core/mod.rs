pub mod error;
pub mod mcp;
pub mod pool;
pub mod scheduler;
pub mod store;
