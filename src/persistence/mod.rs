// Persistence module for the per-address aggregate table
//
// The pipeline talks to storage only through `AddressStore`; `SqliteStore` is
// the durable implementation.

mod store;

pub use store::SqliteStore;

use crate::models::AddressRecord;
use anyhow::Result;

/// Aggregate store contract shared by the queue consumer (writer) and the
/// snapshot scheduler (reader)
pub trait AddressStore: Send + Sync {
    /// Count one more sighting of `address`
    fn upsert(&self, address: &str) -> Result<()>;

    /// All records, highest count first, consistent with every upsert that
    /// returned before this call
    fn snapshot(&self) -> Result<Vec<AddressRecord>>;
}
