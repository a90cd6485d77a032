mod accountant;
mod registry;

pub use accountant::SessionAccountant;
pub use registry::{RegistryError, RegistryStats, Room, RoomLease, RoomRegistry, RoomStats};
