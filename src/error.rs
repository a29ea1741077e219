//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Krpc crate error enum.
pub enum Error {
    /// Lifecycle misuse, e.g. calling start() on a server that is not INITIAL.
    #[error("Illegal state: {0}")]
    IllegalState(&'static str),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// Errors related to parsing DHT messages.
    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Indicates that a node id was not 20 bytes.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Indicates that the message transaction_id is not six bytes.
    #[error("Invalid transaction_id: {0:?}")]
    InvalidTransactionId(Vec<u8>),

    /// An encoded message exceeded the address family's maximum packet size.
    #[error("Encoded message too large: {0} bytes")]
    PacketTooLarge(usize),
}
