//! Persistence for articles and tags, with AND-semantics tag lookups.
//!
//! [`db::Repository`] is the entry point: open it once, share it by reference
//! or `Arc`, and [`db::Repository::close`] it on shutdown.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use db::Repository;
pub use error::{AppError, Result};
pub use models::{Article, NewArticle, NewTag, Tag, TagCandidate, TagCriteria};
