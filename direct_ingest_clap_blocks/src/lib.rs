//! Building blocks for [`clap`]-driven configs of the direct ingest binary.
//!
//! Each block is a `#[clap(flatten)]`-able struct that reads its options from
//! the command line or the environment and knows how to build the service it
//! configures.

pub mod catalog_dsn;
pub mod object_store;
pub mod orchestration;
pub mod tokio;
pub mod warehouse;
