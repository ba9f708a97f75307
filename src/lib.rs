pub mod atomic;
pub mod backend;
pub mod codec;
pub mod config;
pub mod environment;
pub mod error;
pub mod keys;
pub mod model;
pub mod paths;
pub mod redact;
pub mod rotation;
pub mod store;

pub use backend::{BackendKind, KeyValueArea, LocalArea};
pub use codec::SealMode;
pub use config::StoreConfig;
pub use error::StoreError;
pub use keys::KeyStatus;
pub use model::{Conversation, Message, NewMessage, Role, SettingsRecord};
pub use store::{ClearTarget, Store, StoreBuilder};

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, StoreError>;
