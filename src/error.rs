//! The error type shared by all parts of the engine.
//!
//! Configuration and transport failures carry the numeric codes of the legacy
//! connection layer so that frontends built against that numbering keep
//! working.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A required configuration option was not provided.
    #[error("missing option '{0}'")]
    MissingOption(&'static str),

    /// An attempt was made to modify state that is read-only while a session
    /// is active.
    #[error("attempt to modify read-only state: {0}")]
    ReadOnly(&'static str),

    /// A configuration option was provided with a nonsensical value.
    #[error("invalid value provided for '{0}'")]
    InvalidValue(&'static str),

    /// A specific port could not be bound because it is already taken.
    #[error("could not bind to port {0} as it is already in use")]
    PortTaken(u16),

    /// No free port could be found within the bounded retry budget.
    #[error("could not bind to a free {0} socket")]
    Bind(&'static str),

    /// The remote host closed the connection.
    #[error("connection terminated by remote host")]
    RemoteClosed,

    /// An operation that needs a live hub session was invoked without one.
    #[error("not connected to a hub")]
    NotConnected,

    /// An operation that needs a completed configuration was invoked before
    /// one succeeded.
    #[error("the client is not configured")]
    NotConfigured,

    /// A group by this name already exists.
    #[error("a group named '{0}' already exists")]
    GroupExists(String),

    /// A group by this name does not exist.
    #[error("no group named '{0}' exists")]
    UnknownGroup(String),

    /// The default group cannot be deleted or renamed away.
    #[error("the default group cannot be removed")]
    DefaultGroup,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl Error {
    /// The numeric code of the legacy connection layer, if this error maps to
    /// one: 1 missing option, 2 read-only violation, 3 invalid value, 4 port
    /// taken, 5 bind failure, 6 terminated by remote host.
    pub fn code(&self) -> Option<u8> {
        match self {
            Error::MissingOption(_) => Some(1),
            Error::ReadOnly(_) => Some(2),
            Error::InvalidValue(_) => Some(3),
            Error::PortTaken(_) => Some(4),
            Error::Bind(_) => Some(5),
            Error::RemoteClosed => Some(6),
            _ => None,
        }
    }
}
