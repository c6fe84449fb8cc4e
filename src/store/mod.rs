//! SQLite persistence: token records, pending authorizations and listening data.

pub mod db;
pub mod listening;

pub use db::{
    AuthorizationState, ConnectionInfo, ErasureReport, TokenRecord, TokenRecordUpsert, TokenStore,
};
