//! Remote row-store client.

pub mod row_client;

pub use row_client::{AccessTokenProvider, HttpRowStore, RowStoreConfig, StaticTokenProvider};
