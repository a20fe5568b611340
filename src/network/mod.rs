pub mod blob;
pub mod bus;
pub mod presence;

pub use blob::{BlobStore, HttpBlobStore, LocalBlobStore};
pub use bus::{LiveEvent, MessageSubscription, RealtimeBus};
pub use presence::{PresenceGroup, PresenceMember};
