//! addonkeeper
//!
//! Keeps a game client's add-on folder in step with a remote catalog:
//! finds what is installed, reports what is stale, and installs, updates
//! or removes add-ons without breaking bundled or shared folders.
//!
//! # Architecture
//!
//! - **Addons Module**: scanner, freshness, installer pipeline, deletion and the engine facade
//! - **Config Module**: `.akeeprc` loading
//! - **Logging Module**: file logging with retention cleanup
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use addonkeeper::addons::{AddonEngine, CatalogIndex, HttpDownloader, LocalFs};
//!
//! let fs = LocalFs::new("/games/client/AddOns").expect("root exists");
//! let mut engine = AddonEngine::new(Arc::new(fs), CatalogIndex::default(), Arc::new(HttpDownloader::new()));
//! let state = engine.scan().expect("scan");
//! println!("{} installed", state.installed.len());
//! ```

// Clippy configuration - allow common patterns
#![allow(clippy::unnested_or_patterns)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::similar_names)]
#![allow(clippy::struct_excessive_bools)]

pub mod addons;
pub mod config;
pub mod logging;

// Re-export main types
pub use addons::{AddonEngine, BackgroundEngine};
pub use config::Config;
