//! Directory login flow.
//!
//! Authentication proves two things on one connection: the supplied
//! password binds as the located user, and the service account can read
//! what the flow needs around that bind. Failures that could disclose
//! whether an account exists all surface as the same opaque
//! [`Error::Unauthorized`].

use async_trait::async_trait;

use crate::config::DirectoryConfig;
use crate::connection::{DirectoryConnection, bind_service_account};
use crate::error::{DirectoryError, Error, Result};
use crate::filter::{class_filter, escape_value, sanitize_attr, validate_filter};
use crate::groups::resolve_group_memberships;
use crate::principal::{
    Principal, PrincipalScope, entry_to_principal, has_permission,
};
use crate::search::{self, SearchRequest, operational_attributes};

/// What the user typed at the login prompt.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Site-level authorization, consulted after authentication succeeds.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Whether the authenticated principal (or one of its groups) is
    /// allowed in under `access_mode` and `allowed_principal_ids`.
    async fn check_access(
        &self,
        access_mode: &str,
        allowed_principal_ids: &[String],
        principal_id: &str,
        groups: &[Principal],
    ) -> Result<bool>;
}

/// Authenticate `credentials` against the directory and resolve the user's
/// principal and group set.
///
/// The connection ends the call bound as whoever the last step bound it
/// as; callers must not reuse it for another identity without re-binding.
pub async fn login_user<C>(
    conn: &mut C,
    credentials: &Credentials,
    config: &DirectoryConfig,
    access: &dyn AccessControl,
) -> Result<(Principal, Vec<Principal>)>
where
    C: DirectoryConnection + ?Sized,
{
    // An empty password would turn the user bind into an anonymous bind,
    // which many servers accept.
    if credentials.password.is_empty() {
        return Err(Error::MissingRequired("password"));
    }
    if !config.user_login_filter.is_empty() {
        validate_filter(&config.user_login_filter)?;
    }

    bind_service_account(conn, config).await.map_err(|err| {
        tracing::debug!(error = %err, "service account bind failed");
        Error::unauthorized(format!("service account bind failed: {err}"))
    })?;

    let query = format!(
        "(&{}({}={}){})",
        class_filter(&config.user_object_class),
        sanitize_attr(&config.user_login_attribute),
        escape_value(&credentials.username),
        config.user_login_filter,
    );
    tracing::debug!(%query, base = %config.user_search_base, "login search");

    let request = SearchRequest::whole_subtree(
        &config.user_search_base,
        query,
        config.user_search_attributes(),
    );
    let entries = search::search(conn, &request).await.map_err(|err| {
        Error::unauthorized(format!("login search failed: {err}"))
    })?;

    // Exactly one match or the login name is not a usable identifier.
    let user_entry = match entries.as_slice() {
        [] => {
            return Err(Error::unauthorized(format!(
                "cannot locate user {:?}",
                credentials.username
            )));
        },
        [single] => single,
        _ => {
            return Err(Error::unauthorized(format!(
                "login search for {:?} matched {} entries",
                credentials.username,
                entries.len()
            )));
        },
    };

    conn.bind(&user_entry.dn, &credentials.password)
        .await
        .map_err(|err| match err {
            DirectoryError::InvalidCredentials => {
                Error::unauthorized(format!(
                    "password rejected for {}",
                    user_entry.dn
                ))
            },
            other => Error::Server(format!("user bind failed: {other}")),
        })?;

    if !has_permission(user_entry, config) {
        return Err(Error::PermissionDenied);
    }

    if config.search_using_service_account {
        bind_service_account(conn, config).await.map_err(|err| {
            Error::unauthorized(format!(
                "service account re-bind failed: {err}"
            ))
        })?;
    }

    // Some servers only expose virtual membership attributes through an
    // explicit operational-attribute read of the entry itself.
    let op_request = SearchRequest::base_object(
        &user_entry.dn,
        class_filter(&config.user_object_class),
        operational_attributes(),
    );
    let op_entries = search::search(conn, &op_request).await.map_err(|err| {
        Error::unauthorized(format!("operational re-fetch failed: {err}"))
    })?;
    let Some(op_entry) = op_entries.first() else {
        return Err(Error::unauthorized(format!(
            "operational re-fetch found nothing at {}",
            user_entry.dn
        )));
    };

    let scope = PrincipalScope::user(config.provider);
    let principal =
        entry_to_principal(user_entry, &user_entry.dn, scope, config)?
            .ok_or_else(|| {
                Error::unauthorized(format!(
                    "{} does not carry object class {}",
                    user_entry.dn, config.user_object_class
                ))
            })?;

    let groups = resolve_group_memberships(conn, config, user_entry, op_entry)
        .await
        .map_err(|err| {
            tracing::debug!(
                partial = err.partial.len(),
                "login aborted after partial group resolution"
            );
            err.source
        })?;

    let allowed = access
        .check_access(
            &config.access_mode,
            &config.allowed_principal_ids,
            &principal.id,
            &groups,
        )
        .await?;
    if !allowed {
        return Err(Error::PermissionDenied);
    }

    tracing::debug!(
        principal = %principal.id,
        groups = groups.len(),
        "login complete"
    );
    Ok((principal, groups))
}
