//! Joomla 2.5/3 → Cyclope migration engine.
//!
//! The source site is read through [`store::SourceStore`], the CMS database is
//! written through [`store::TargetStore`], and [`orchestrator::Migration`]
//! sequences the phases between them.
pub mod config;
pub mod database_ops;
pub mod error;
pub mod migrate;
pub mod model;
pub mod orchestrator;
pub mod store;
pub mod tracing;

pub mod util {
    pub mod env;
    pub mod progress;
}
