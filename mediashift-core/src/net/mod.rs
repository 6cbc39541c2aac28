//! Peer discovery and the file transfer protocol.

pub mod discovery;
pub mod transfer;

pub use discovery::{Announcement, DiscoveryEvent, DiscoveryService, NetworkPeer, PeerRole};
pub use transfer::{read_frame, receive_file, send_file, write_frame, Frame};
