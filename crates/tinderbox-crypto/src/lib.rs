pub mod config;
pub mod cryptobox;
pub mod engine;
pub mod error;
pub mod events;
pub mod lru;
pub mod pool;
pub mod prekey;
pub mod session;
pub mod store;
pub mod tracker;

pub use config::CryptoboxConfig;
pub use cryptobox::{Cryptobox, Resolution};
pub use engine::{IdentityKeyPair, PreKeySource, ProtocolEngine, X3dhEngine, X3dhSession};
pub use error::{CryptoboxError, EngineError, Payload, StoreError};
pub use events::CryptoboxEvent;
pub use lru::LruCache;
pub use prekey::{PreKey, PreKeyId, SerializedPreKey, StoredPreKey, LAST_RESORT_PREKEY_ID};
pub use session::{CryptoboxSession, SessionCache};
pub use store::{CryptoboxStore, MemoryStore};
