pub mod controller;
pub mod hash;
pub mod inventory;
pub mod lock;
pub mod object;
pub mod path;

pub use controller::{CacheController, ProcessIdentity};
pub use hash::{HASH_SIZE, HashParseError, TranslationHash, TranslationHasher};
pub use inventory::{EntrySummary, Inventory};
pub use object::CachedObject;
pub use path::{EntryName, TEMP_SUFFIX};
