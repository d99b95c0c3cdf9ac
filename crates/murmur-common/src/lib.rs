pub mod errors;
pub mod events;
pub mod id;

pub use errors::{ConfigError, DeviceError, MurmurError, NegotiationError, TransportError};
pub use events::EventBus;
pub use id::{new_id, short_id, SessionId};

pub type Result<T> = std::result::Result<T, MurmurError>;
