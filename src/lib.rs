pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod group;
pub mod identity;
pub mod keystore;
pub mod noise;
pub mod profile;
pub mod receipts;
pub mod relay;
pub mod repositories;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use config::MeshConfig;
pub use controller::MeshController;
pub use error::{CodecError, CryptoError, StateError, StorageError, TransportError};
pub use group::FluxonGroup;
pub use identity::Identity;
pub use relay::MeshRelay;
pub use store::MessageStore;
pub use types::{Packet, PacketId, PacketType, PeerId};
