pub mod query;
pub mod reconcile;
mod repository;
pub mod schema;

pub use repository::Repository;
