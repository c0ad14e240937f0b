pub mod crypto;
pub mod message;
pub mod packet;
pub mod server;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use packet::Msg;

use skiff_format::numbers;

#[doc(hidden)]
pub use skiff_format as __format;

#[derive(Debug)]
pub enum SshStatus {
    /// The client has sent a disconnect request, close the connection.
    /// This is not an error.
    Disconnect,
    /// The peer did something wrong.
    /// The connection should be closed with a DISCONNECT carrying `reason`,
    /// a notice may be logged, but this does not require operator intervention.
    PeerError { reason: u32, message: String },
}

impl SshStatus {
    pub fn disconnect_reason(&self) -> Option<u32> {
        match self {
            Self::Disconnect => None,
            Self::PeerError { reason, .. } => Some(*reason),
        }
    }
}

impl std::fmt::Display for SshStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnect => f.write_str("disconnected"),
            Self::PeerError { reason, message } => write!(
                f,
                "{message} ({})",
                numbers::disconnect_reason_to_string(*reason)
            ),
        }
    }
}

impl From<skiff_format::ParseError> for SshStatus {
    fn from(err: skiff_format::ParseError) -> Self {
        Self::PeerError {
            reason: numbers::SSH_DISCONNECT_PROTOCOL_ERROR,
            message: err.0,
        }
    }
}

pub type Result<T, E = SshStatus> = std::result::Result<T, E>;

pub trait SshRng {
    fn fill_bytes(&mut self, dest: &mut [u8]);
}

/// A protocol error, disconnecting with `SSH_DISCONNECT_PROTOCOL_ERROR`.
#[macro_export]
macro_rules! peer_error {
    ($($tt:tt)*) => {
        $crate::SshStatus::PeerError {
            reason: $crate::__format::numbers::SSH_DISCONNECT_PROTOCOL_ERROR,
            message: ::std::format!($($tt)*),
        }
    };
}

/// A fatal error with a specific disconnect reason.
#[macro_export]
macro_rules! disconnect_error {
    ($reason:expr, $($tt:tt)*) => {
        $crate::SshStatus::PeerError {
            reason: $reason,
            message: ::std::format!($($tt)*),
        }
    };
}
