//! Staffing-plan ingestion service library.
//!
//! The service ships a `lotacao-ingest` binary; the library surface exists
//! for integration testing and reuse.
//!
//! Flow of one HR delivery: the [`gateway`] authenticates and validates it,
//! the [`resolver`] decides admissions against the plan, the [`retry`]
//! coordinator drives the [`normalization`] engine, and every write reaches
//! storage through the [`staffing`] repository. Work that cannot finish
//! inline becomes a [`jobs`] entry.

pub mod api;
pub mod audit;
pub mod cache;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod gateway;
pub mod inbox;
pub mod jobs;
pub mod normalization;
pub mod notify;
pub mod proposals;
pub mod resolver;
pub mod retry;
pub mod staffing;
pub mod state;

#[cfg(test)]
mod test_support;
