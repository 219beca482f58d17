pub mod encryption_key_rotation_service;
pub mod encryption_service;
pub mod key_cache;
pub mod key_provider;
pub mod reencryption_service;
pub mod rotation_lock;
pub mod secret_store;

pub use encryption_key_rotation_service::{EncryptionKeyRotationService, RotationStatus};
pub use encryption_service::{EncryptionError, EncryptionService};
pub use key_cache::KeyCache;
pub use key_provider::KeyProvider;
pub use reencryption_service::{EncryptedFieldSource, MemoryFieldSource, ReencryptionService, SqlFieldSource};
pub use rotation_lock::{DatabaseRotationLock, InMemoryRotationLock, RotationLock};
pub use secret_store::{DatabaseKeyStore, KeyStore, MemoryKeyStore, VaultConfig, VaultKeyStore};
