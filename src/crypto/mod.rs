//! Message integrity and confidentiality for SMB2/3 packets

pub mod encryption;
pub mod kdf;
pub mod signing;

pub use encryption::PacketEncryptor;
pub use signing::{PacketSignatory, SigningAlgorithm, SigningKey};
