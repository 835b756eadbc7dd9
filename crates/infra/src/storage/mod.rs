//! Record store adapters for migration units.

pub mod postgres;

pub use postgres::PostgresRecordStore;
