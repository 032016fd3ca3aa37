//! Directory authentication and group membership resolution.
//!
//! Authenticates users against an LDAP directory and resolves their full,
//! nested group membership, tolerating the different ways directory
//! servers represent membership. The caller owns the connection; every
//! flow here borrows one [`DirectoryConnection`], re-binding it as the
//! service account or the end user as the flow requires.
//!
//! Entry points:
//! - [`login_user`]: credential check plus group resolution;
//! - [`search_principals`]: ad hoc user and group search;
//! - [`get_principal`]: retrieval by distinguished name;
//! - [`refetch_group_principals`]: refresh a known user's group set.

#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod groups;
pub mod lookup;
pub mod principal;
pub mod search;

pub use auth::{AccessControl, Credentials, login_user};
pub use config::DirectoryConfig;
pub use connection::{DirectoryConnection, LdapHandle};
pub use error::{DirectoryError, Error, Result};
pub use groups::{MembershipError, resolve_group_memberships};
pub use lookup::{
    get_principal, parse_principal_id, refetch_group_principals,
    search_principals,
};
pub use principal::{Principal, PrincipalKind, PrincipalScope, Provider};
pub use search::SearchRequest;
