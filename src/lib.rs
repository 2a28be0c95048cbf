//! greenbox — reservation engine for a fixed pool of shared planter
//! boxes.
//!
//! A fixed catalog of boxes is allocated to apartment households, one
//! active registration per apartment and one occupant per box, with a
//! strictly FIFO waitlist once the pool runs out and an append-only
//! audit trail covering every mutation. Each public operation runs as
//! one transaction: acquire the affected row locks, validate, append a
//! single commit record to the WAL, apply in memory. A failure anywhere
//! before the WAL append leaves no partial state behind.
//!
//! The crate is a library; routing, sessions, input validation and
//! email rendering live in the embedding layer. A typical boot:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use greenbox::config::Config;
//! use greenbox::engine::Engine;
//! use greenbox::model::{Actor, BoxSpec};
//! use greenbox::notify::{LogNotifier, NotifyHub};
//! use greenbox::{observability, tasks};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env();
//!     observability::init(config.metrics_port);
//!     std::fs::create_dir_all(&config.data_dir)?;
//!
//!     let engine = Arc::new(Engine::open(config.wal_path(), Arc::new(NotifyHub::new()))?);
//!     engine
//!         .provision(Actor::system(), &[BoxSpec::new(1, "Linaria", "Kronen")])
//!         .await?;
//!
//!     tokio::spawn(tasks::run_dispatcher(
//!         engine.clone(),
//!         Arc::new(LogNotifier),
//!         config.dispatch_interval,
//!         config.delivery_attempts,
//!     ));
//!     tokio::spawn(tasks::run_compactor(engine.clone(), config.compact_threshold));
//!
//!     // Hand `engine` to the serving layer.
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod tasks;
pub mod wal;
