pub mod blob;
pub mod domain;
pub mod error;
pub mod models;
pub mod protocol;
pub mod query;
