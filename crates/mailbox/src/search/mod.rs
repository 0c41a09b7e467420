//! Search over a user's mail
//!
//! Two read paths:
//! - [`FuzzyIndex`]: string-similarity ranking over the cached snapshots
//!   from the user's latest sync
//! - [`SemanticSearch`]: nearest stored embeddings to an embedded query

mod fuzzy;
mod index;
mod semantic;

pub use fuzzy::{partial_ratio, ratio, token_set_ratio, token_sort_ratio, weighted_ratio};
pub use index::{FuzzyIndex, SearchHit};
pub use semantic::{SemanticHit, SemanticSearch, euclidean_distance};
