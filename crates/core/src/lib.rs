pub mod catalog;
pub mod clock;
pub mod error;
pub mod flag;
pub mod ids;
pub mod projection;
pub mod snapshot;

pub use catalog::StaticCatalog;
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use error::CoreError;
pub use flag::{FlagCategory, FlagPatch, FlagRecord};
pub use ids::*;
pub use snapshot::{CacheSnapshot, CacheState};
