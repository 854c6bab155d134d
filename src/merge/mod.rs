pub mod boundary;
pub mod histogram;
pub mod store;

use std::time::Instant;

use self::histogram::Histogram;

/// A decoded object on its way into the aggregation store.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedObject {
    pub name: String,
    pub payload: Histogram,
    pub observed_at: Instant,
}
