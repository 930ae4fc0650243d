//! Infrastructure layer: retry policy, cache, repository, job queue and
//! configuration.
//!
//! Everything here is an explicit, process-scoped object: load an
//! [`AppConfig`](config::AppConfig) once, build a [`JobQueue`](jobs::JobQueue),
//! a [`Cache`](cache::Cache) and the [`Repository`](repository::Repository)
//! handles from it, and pass those handles to whoever needs them.

pub mod cache;
pub mod config;
pub mod jobs;
pub mod pipeline;
pub mod repository;
pub mod retry;
