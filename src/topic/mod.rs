//! Topic name/filter validation and wildcard matching.
//!
//! The connection runtime's subscription table (`connection::subscription`)
//! builds on the trie here; this module owns only the pure matching and
//! validation logic, with no notion of a connection, reference count, or
//! callback.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    topic_matches_filter, validate_topic_filter, validate_topic_filter_with_max_levels,
    validate_topic_name, validate_topic_name_with_max_levels, TopicLevel,
};
