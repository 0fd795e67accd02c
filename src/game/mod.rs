//! Player state synchronization

pub mod movement;
pub mod player;
pub mod registry;
pub mod session;

pub use player::{PlayerId, PlayerState};
pub use registry::{Registration, RegistryError, SessionRegistry};
pub use session::Session;
