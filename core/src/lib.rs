//! shardplan - index-driven query planning over date-sharded tables

pub mod bitmap;
pub mod codec;
pub mod config;
pub mod error;
pub mod planner;
pub mod pool;
pub mod pruning;
pub mod query;
pub mod shard;
pub mod store;
pub mod stream;

pub use bitmap::{BitSetIndexEntry, ShardBitmap};
pub use codec::{CodecError, Serializable};
pub use config::{ConfigLoader, PlannerSettings, PlanningConfig};
pub use error::{PlanError, PlanResult};
pub use planner::{NumShardCache, PlanStream, QueryPlan, QueryPlanner, RangeStream};
pub use pruning::DayIndexStream;
pub use query::{Marker, Node};
pub use store::{Authorizations, Key, MemoryStore, Range, Scanner, Store, StoreError};
pub use stream::{IndexInfo, IndexStream, StreamContext};
