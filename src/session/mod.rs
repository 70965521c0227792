//! Interactive shell session over a container attach

mod session;
mod transport;

pub use session::{CommandResult, Session, SessionError, SessionResult};
pub use transport::{DockerTransport, Transport};
