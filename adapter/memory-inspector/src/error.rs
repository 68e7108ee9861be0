use std::fmt;

pub type Error = Box<dyn std::error::Error>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Blame {
    Internal, // Caused by the inspector itself, should not be displayed to the user.
    User,     // Caused by user input or by the state of the debug session, should be displayed to the user.
    Nobody,   // Expected degradation, should not be displayed to the user or logged as an error.
}

#[derive(Debug)]
pub struct BlamedError {
    pub blame: Blame,
    pub inner: Error,
}

impl BlamedError {
    pub fn assign_blame(self, blame: Blame) -> BlamedError {
        BlamedError {
            blame,
            inner: self.inner,
        }
    }
}

impl From<Error> for BlamedError {
    fn from(err: Error) -> BlamedError {
        let err = match err.downcast::<BlamedError>() {
            Ok(blamed) => return *blamed,
            Err(err) => err,
        };
        // Gate failures are about the session's state, not about us.
        let blame = if err.is::<SessionError>() { Blame::User } else { Blame::Internal };
        BlamedError { blame, inner: err }
    }
}

impl fmt::Display for BlamedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for BlamedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.inner)
    }
}

pub fn blame_user(err: Error) -> BlamedError {
    BlamedError {
        blame: Blame::User,
        inner: err,
    }
}

pub fn blame_nobody(err: Error) -> BlamedError {
    BlamedError {
        blame: Blame::Nobody,
        inner: err,
    }
}

pub fn str_error(err_msg: impl ToString) -> Error {
    err_msg.to_string().into()
}

/// Errors raised by the session and capability gates of the session tracker,
/// and by the breakpoint partitioning when the adapter's reply can't be attributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    NoActiveSession { action: String },
    UnknownSession { action: String, id: String },
    MissingCapability { action: String, capability: String },
    BreakpointMismatch { requested: usize, returned: usize },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::NoActiveSession { action } => write!(f, "cannot {}: no active debug session", action),
            SessionError::UnknownSession { action, .. } => write!(f, "cannot {}: no active debug session", action),
            SessionError::MissingCapability { action, capability } => {
                write!(f, "cannot {}: session does not have capability '{}'", action, capability)
            }
            SessionError::BreakpointMismatch { requested, returned } => write!(
                f,
                "adapter returned {} data breakpoints for a request of {}",
                returned, requested
            ),
        }
    }
}

impl std::error::Error for SessionError {}

macro_rules! bail(($err:expr) => (return Err(From::from($err))));

macro_rules! log_errors(($e:expr) => (if let Err(err) = $e { log::error!("[{}] {}", line!(), err); }));
