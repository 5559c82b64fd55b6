//! Pricing-context domain: the parsed catalog, the per-session working set
//! of context items, and the single-flight transformation cache.

pub mod cache;
pub mod catalog;
pub mod context;

pub use cache::{PricingCache, TransformOutcome};
pub use catalog::{PricingCatalog, ValueType};
pub use context::{CanonicalUrl, ContextArena, ItemKind, ItemOrigin, PricingContextItem, TransformState};
