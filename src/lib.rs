// Public API for integration tests and the terminal driver

pub mod backend;
pub mod code;
pub mod feed;
pub mod session;
pub mod types;

pub use backend::{Backend, BackendConfig, BackendError};
pub use session::{RoomSession, SessionConfig, SessionError, SessionSnapshot};
