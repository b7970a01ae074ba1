pub mod coordinator;
pub mod peer_link;

pub use coordinator::{CoordinatorActor, CoordinatorArguments, CoordinatorMsg, StatusReport};
pub use peer_link::{PeerLinkActor, PeerLinkArguments, PeerLinkMsg};
