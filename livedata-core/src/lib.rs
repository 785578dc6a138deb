//! # livedata-core — Document store and live query engine
//!
//! Everything a live-data client or server needs that does not touch the
//! network: the extended JSON value model, id handling, an in-memory
//! MongoDB-style collection and the diff machinery that turns collection
//! writes into observer callbacks.
//!
//! ## Architecture
//!
//! ```text
//!   selector ──► Matcher ┐
//!   sort ──────► Sorter  ├──► Cursor ──fetch──► Vec<Document>
//!   fields ────► Projection┘     │
//!                                │ observe_changes
//!                                ▼
//! ┌──────────────┐  write  ┌─────────────────┐  added/changed/  ┌──────────┐
//! │  Modifier    │────────►│ LocalCollection │─ moved/removed ─►│ observer │
//! │ ($set, $inc) │         │ IdMap<Document> │                  └──────────┘
//! └──────────────┘         └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`value`] — [`Value`] / [`Document`], total ordering and equality
//! - [`ejson`] — EJSON text codec and custom type registry
//! - [`id_map`] — id stringification, [`IdMap`] and [`OrderedDict`]
//! - [`random`] — random ids and seeded per-scope id streams
//! - [`selector`], [`sorter`], [`projection`], [`modifier`] — query language
//! - [`collection`], [`cursor`] — the store and its live queries
//! - [`diff`], [`observe`] — result diffing and observer interfaces
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Selector match (simple equality) | <200ns |
//! | Insert with 10 live queries | <20µs |
//! | Ordered diff, 1K docs | <1ms |

pub mod collection;
pub mod cursor;
pub mod diff;
pub mod ejson;
pub mod error;
pub mod id_map;
pub mod modifier;
pub mod observe;
pub mod path;
pub mod projection;
pub mod random;
pub mod selector;
pub mod sorter;
pub mod value;

// Re-exports for convenience
pub use collection::{Collection, FindOptions, LocalCollection, UpdateOptions, UpdateResult};
pub use cursor::{Cursor, ObserveHandle};
pub use diff::{
    apply_changes, diff_maps, diff_objects, diff_query_changes, diff_query_ordered_changes,
    diff_query_unordered_changes, make_changed_fields, QueryResults,
};
pub use ejson::{CustomType, EjsonError, TypeRegistry};
pub use error::{Error, Result};
pub use id_map::{id_parse, id_stringify, IdMap, OrderedDict};
pub use modifier::Modifier;
pub use observe::{ChangedFields, Observe, ObserveAdapter, ObserveChanges};
pub use projection::Projection;
pub use random::RandomStream;
pub use selector::Matcher;
pub use sorter::Sorter;
pub use value::{Document, Value};
