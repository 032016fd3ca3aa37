//! Error vocabulary for directory authentication.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Caller-facing errors.
///
/// Callers map these to transport-level responses; the engine defines no
/// wire format. [`Error::Server`] and [`Error::Ldap`] both belong to the
/// server-error class: not user-attributable, safe to retry at a higher
/// layer. The engine itself never retries.
#[derive(Debug, Error)]
pub enum Error {
    /// A required input was absent, e.g. an empty password.
    #[error("{0} not provided")]
    MissingRequired(&'static str),

    /// A configuration-supplied filter fragment or option failed validation.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// Credential mismatch, ambiguous user lookup, or any bind failure whose
    /// cause must not be disclosed. Display stays generic; `reason` exists
    /// for operator diagnostics only.
    #[error("Unauthorized")]
    Unauthorized { reason: String },

    /// The access-control collaborator rejected an authenticated principal.
    #[error("Permission denied")]
    PermissionDenied,

    #[error("directory server error: {0}")]
    Server(String),

    #[error(transparent)]
    Ldap(#[from] ldap3::LdapError),

    /// A direct lookup by identifier found no matching entry.
    #[error("{0} not found")]
    NotFound(String),
}

impl Error {
    /// Generic credential failure; `reason` never reaches end users.
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Error::Unauthorized {
            reason: reason.into(),
        }
    }
}

/// Errors crossing the [`DirectoryConnection`] seam.
///
/// The protocol result codes the engine reacts to are lifted into variants
/// here, so that callers and fakes never inspect raw codes.
///
/// [`DirectoryConnection`]: crate::connection::DirectoryConnection
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("no such object")]
    NoSuchObject,

    #[error(transparent)]
    Ldap(#[from] ldap3::LdapError),
}

impl From<DirectoryError> for Error {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::InvalidCredentials => {
                Error::unauthorized("invalid credentials")
            },
            DirectoryError::NoSuchObject => {
                Error::NotFound("directory entry".into())
            },
            DirectoryError::Ldap(err) => Error::Ldap(err),
        }
    }
}
