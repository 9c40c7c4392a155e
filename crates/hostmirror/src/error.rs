use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Credential,
    Unreachable,
    Transfer,
    Repair,
    Cancelled,
}

impl ErrorKind {
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Config => 2,
            ErrorKind::Credential => 3,
            ErrorKind::Unreachable => 4,
            ErrorKind::Transfer => 5,
            ErrorKind::Repair => 6,
            ErrorKind::Cancelled => 130,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Credential => "credential",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Transfer => "transfer",
            ErrorKind::Repair => "repair",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn credential<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Credential, msg)
    }

    pub fn unreachable<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Unreachable, msg)
    }

    pub fn transfer<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Transfer, msg)
    }

    pub fn repair<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Repair, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    // Prefix the message, keeping the kind so exit codes survive wrapping.
    pub fn context<C: fmt::Display>(self, ctx: C) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{ctx}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let err = Error::unreachable("connection refused").context("task 'destination.probe' failed");
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert_eq!(
            err.to_string(),
            "task 'destination.probe' failed: connection refused"
        );
        assert_eq!(err.kind().exit_code(), 4);
    }

    #[test]
    fn io_errors_are_config_errors() {
        let err: Error = std::io::Error::other("boom").into();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
