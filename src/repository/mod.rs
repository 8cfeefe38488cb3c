//! Audit repository layer

pub mod audit_repo;
pub mod memory;

pub use audit_repo::*;
pub use memory::MemoryAuditStore;
