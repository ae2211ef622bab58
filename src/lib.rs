//! # Stockroom - Catalog and Cache Engine
//!
//! `stockroom` keeps a sorted in-memory catalog of trading-item metadata
//! (items, colors, categories, item types) persisted in a self-describing
//! chunked binary container, and layers two disk-backed, network-refreshed
//! object caches on top of it: price guides and item pictures.
//!
//! - **Chunked container** with id/version framing, 16-byte alignment and
//!   verifying trailers; unknown chunks are skipped, old flat files still load
//! - **Atomic catalog replacement**: a failed load never disturbs the
//!   previous generation
//! - **Cost-bounded caches** with a per-object state machine
//!   (`Ready -> Loading -> Updating -> Ok / UpdateFailed`) and request
//!   coalescing
//! - **Background disk loads** on a worker pool, **network refreshes** behind
//!   a transport trait, including an authenticated-session channel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stockroom::{Core, CoreConfig, ItemKey, Result};
//! # use stockroom::transfer::Transport;
//! # fn demo(transport: std::sync::Arc<dyn Transport>) -> Result<()> {
//! let mut core = Core::new(CoreConfig::new("/var/cache/stockroom"), transport)?;
//! core.load_catalog(None)?;
//!
//! // synchronous access; a refresh is scheduled if the data is stale
//! let guide = core.price_guide(ItemKey::new('P', "3001"), 4, true);
//!
//! // apply pending completions and fan out notifications
//! core.process_events();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod catalog;
pub mod changelog;
pub mod chunk;
pub mod core;
pub mod diskload;
pub mod error;
pub mod picture;
pub mod priceguide;
pub mod transfer;
pub mod types;

pub use crate::cache::{CacheKey, Cached, CachedHandle, ObjectCache, UpdateStatus};
pub use crate::catalog::{Catalog, FormatVersion};
pub use crate::changelog::{ChangeLog, ColorChange, Incomplete, ItemChange, Resolution};
pub use crate::core::{Core, CoreConfig, Event};
pub use crate::error::{Error, Result};
pub use crate::picture::{PictureData, PictureHandle};
pub use crate::priceguide::{Condition, PriceBand, PriceGuideData, PriceGuideHandle, TimeBand};
pub use crate::transfer::{
    Method, Outcome, SessionEndpoints, TransferJob, TransferResult, Transport,
};
pub use crate::types::{AppearsIn, Category, Color, Item, ItemKey, ItemType, PartRef};
