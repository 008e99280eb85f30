pub mod error;
pub mod schema;
pub mod service;
pub mod sqlite;
pub mod tagged_cache;
pub mod traits;

pub use error::StorageError;
pub use service::{flag_tag, FlagService, FLAGS_CACHE_KEY, FLAGS_TAG};
pub use sqlite::{SqliteFlagStore, SqliteKeyStore};
pub use tagged_cache::{InvalidationHook, TaggedCache};
pub use traits::*;
