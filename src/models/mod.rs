pub mod envelope;
pub mod rotation;
pub mod tenant_key;

pub use envelope::*;
pub use rotation::*;
pub use tenant_key::*;
