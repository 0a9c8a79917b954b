use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RnsError {
    OutOfMemory,
    InvalidArgument,
    IncorrectSignature,
    IncorrectHash,
    CryptoError,
    PacketError,
    ConnectionError,
}

impl fmt::Display for RnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::InvalidArgument => "invalid argument",
            Self::IncorrectSignature => "incorrect signature",
            Self::IncorrectHash => "incorrect hash",
            Self::CryptoError => "crypto error",
            Self::PacketError => "packet error",
            Self::ConnectionError => "connection error",
        };
        write!(f, "{msg}")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RnsError {}
