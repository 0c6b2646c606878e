//! # Persistence
//!
//! The gateway contract the control plane is written against, plus its in-memory and
//! PostgreSQL implementations.

pub mod gateway;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use gateway::{
    GatewayError, GatewayResult, LinkedResourceFilter, PaginatedResult, Pagination,
    PersistenceGateway,
};
pub use memory::MemoryGateway;
#[cfg(feature = "postgres")]
pub use postgres::PgGateway;
