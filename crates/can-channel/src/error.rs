use std::io;
use thiserror::Error;

pub type Result<T, E = ChannelError> = core::result::Result<T, E>;

/// Every failure a [`CanChannel`](crate::CanChannel) can report.
///
/// `socket` is the handle the channel held when the failure happened
/// (`-1` once closed). `os_code` is the raw errno when the kernel produced one.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid socket {socket}: channel is not open")]
    InvalidSocket { socket: i32 },
    #[error("initialisation failed: {message}")]
    Init {
        message: String,
        os_code: Option<i32>,
    },
    #[error("close failed on socket {socket}: {message}")]
    Close {
        message: String,
        socket: i32,
        os_code: Option<i32>,
    },
    #[error("I/O error on socket {socket}: {message}")]
    Io {
        message: String,
        socket: i32,
        os_code: Option<i32>,
    },
    #[error("invalid frame for socket {socket}: {message}")]
    Validation { message: String, socket: i32 },
}

impl ChannelError {
    pub(crate) fn init(context: impl AsRef<str>, err: &io::Error) -> Self {
        ChannelError::Init {
            message: format!("{}: {}", context.as_ref(), describe(err)),
            os_code: err.raw_os_error(),
        }
    }

    pub(crate) fn close(context: impl AsRef<str>, socket: i32, err: Option<&io::Error>) -> Self {
        let message = match err {
            Some(e) => format!("{}: {}", context.as_ref(), describe(e)),
            None => context.as_ref().to_string(),
        };
        ChannelError::Close {
            message,
            socket,
            os_code: err.and_then(io::Error::raw_os_error),
        }
    }

    pub(crate) fn io(context: impl AsRef<str>, socket: i32, err: &io::Error) -> Self {
        ChannelError::Io {
            message: format!("{}: {}", context.as_ref(), describe(err)),
            socket,
            os_code: err.raw_os_error(),
        }
    }

    /// Raw errno carried by this error, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            ChannelError::Init { os_code, .. }
            | ChannelError::Close { os_code, .. }
            | ChannelError::Io { os_code, .. } => *os_code,
            ChannelError::InvalidSocket { .. } | ChannelError::Validation { .. } => None,
        }
    }

    /// Socket handle at the time of failure. Initialisation errors have none.
    pub fn socket(&self) -> Option<i32> {
        match self {
            ChannelError::InvalidSocket { socket }
            | ChannelError::Close { socket, .. }
            | ChannelError::Io { socket, .. }
            | ChannelError::Validation { socket, .. } => Some(*socket),
            ChannelError::Init { .. } => None,
        }
    }
}

// "Error: 19 => No such device", the same shape for every errno-backed message.
fn describe(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(code) => format!("Error: {code} => {err}"),
        None => format!("Error: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_error_embeds_errno() {
        let err = ChannelError::init("resolving can9", &io::Error::from_raw_os_error(19));
        assert_eq!(err.os_code(), Some(19));
        assert_eq!(err.socket(), None);
        let text = err.to_string();
        assert!(text.starts_with("initialisation failed: resolving can9: Error: 19 =>"));
    }

    #[test]
    fn close_without_os_error_keeps_plain_message() {
        let err = ChannelError::close("cannot close an invalid socket", -1, None);
        assert_eq!(err.os_code(), None);
        assert_eq!(err.socket(), Some(-1));
        assert_eq!(
            err.to_string(),
            "close failed on socket -1: cannot close an invalid socket"
        );
    }
}
