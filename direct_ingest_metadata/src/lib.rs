//! The operations metadata store: append-only instance status history, raw file
//! bookkeeping and ingest view materialization jobs.
//!
//! [`interface::Catalog`] is the storage seam with in-memory and Postgres
//! backends. The [`managers`] scope it to one region and instance and own every
//! mutation of the metadata.

pub mod interface;
pub mod managers;
pub mod mem;
pub mod postgres;

#[cfg(test)]
mod interface_tests;

pub use interface::{Catalog, Error as CatalogError};
pub use managers::{
    Error, InstanceStatusManager, MaterializationMetadataManager, RawFileMetadataManager, Result,
    allowed_transitions,
};
pub use mem::MemCatalog;
pub use postgres::{PostgresCatalog, PostgresConnectionOptions};
