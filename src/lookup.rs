//! Ad hoc principal lookup and search.
//!
//! Independent of any login flow: UI-facing prefix search for users and
//! groups, direct retrieval by distinguished name, and out-of-band group
//! refetch for a known principal.

use crate::config::DirectoryConfig;
use crate::connection::{DirectoryConnection, bind_service_account};
use crate::error::{DirectoryError, Error, Result};
use crate::filter::{class_filter, escape_value, sanitize_attr, validate_filter};
use crate::groups::resolve_group_memberships;
use crate::principal::{
    Principal, PrincipalKind, PrincipalScope, first_attribute, has_permission,
};
use crate::search::{self, SearchRequest, operational_attributes};

/// Attributes whose directory syntax is an integer; wildcards are invalid
/// against them, so prefix matching degrades to exact matching.
const INTEGER_ATTRIBUTES: [&str; 2] = ["uidNumber", "gidNumber"];

/// Search users and/or groups whose names start with `name`.
///
/// `kind` of `None` runs both searches and concatenates the results.
pub async fn search_principals<C>(
    conn: &mut C,
    name: &str,
    kind: Option<PrincipalKind>,
    config: &DirectoryConfig,
) -> Result<Vec<Principal>>
where
    C: DirectoryConnection + ?Sized,
{
    let mut principals = Vec::new();

    if kind.is_none() || kind == Some(PrincipalKind::User) {
        principals.extend(search_users(conn, name, config).await?);
    }
    if kind.is_none() || kind == Some(PrincipalKind::Group) {
        principals.extend(search_groups(conn, name, config).await?);
    }

    Ok(principals)
}

/// Prefix search over the configured pipe-delimited user attributes.
pub async fn search_users<C>(
    conn: &mut C,
    name: &str,
    config: &DirectoryConfig,
) -> Result<Vec<Principal>>
where
    C: DirectoryConnection + ?Sized,
{
    if !config.user_search_filter.is_empty() {
        validate_filter(&config.user_search_filter)?;
    }

    let mut clauses = String::new();
    for attr in config.user_search_attribute.split('|') {
        if INTEGER_ATTRIBUTES.contains(&attr) {
            clauses.push_str(&format!(
                "({}={})",
                sanitize_attr(attr),
                escape_value(name),
            ));
        } else {
            clauses.push_str(&format!(
                "({}={}*)",
                sanitize_attr(attr),
                escape_value(name),
            ));
        }
    }
    let query = format!(
        "(&{}(|{}){})",
        class_filter(&config.user_object_class),
        clauses,
        config.user_search_filter,
    );

    tracing::debug!(%query, "user principal search");
    search_directory(
        conn,
        config,
        &query,
        PrincipalScope::user(config.provider),
    )
    .await
}

/// Name search over the configured group attribute.
pub async fn search_groups<C>(
    conn: &mut C,
    name: &str,
    config: &DirectoryConfig,
) -> Result<Vec<Principal>>
where
    C: DirectoryConnection + ?Sized,
{
    if !config.group_search_filter.is_empty() {
        validate_filter(&config.group_search_filter)?;
    }

    let attr = sanitize_attr(&config.group_search_attribute);
    let clause = if INTEGER_ATTRIBUTES
        .contains(&config.group_search_attribute.as_str())
    {
        format!("({}={})", attr, escape_value(name))
    } else {
        format!("({}=*{}*)", attr, escape_value(name))
    };
    let query = format!(
        "(&{}{}{})",
        class_filter(&config.group_object_class),
        clause,
        config.group_search_filter,
    );

    tracing::debug!(%query, "group principal search");
    search_directory(
        conn,
        config,
        &query,
        PrincipalScope::group(config.provider),
    )
    .await
}

/// Retrieve one principal by distinguished name.
///
/// A missing base object is [`Error::NotFound`], unlike login searches.
/// When the service account cannot bind but the provider is enabled, a
/// DN-only placeholder principal is returned so existing references stay
/// displayable.
pub async fn get_principal<C>(
    conn: &mut C,
    distinguished_name: &str,
    scope: PrincipalScope,
    config: &DirectoryConfig,
) -> Result<Option<Principal>>
where
    C: DirectoryConnection + ?Sized,
{
    if scope.provider != config.provider {
        return Err(Error::InvalidOption(format!("invalid scope {scope}")));
    }

    if let Err(err) = bind_service_account(conn, config).await {
        if matches!(err, DirectoryError::InvalidCredentials) && config.enabled
        {
            tracing::debug!(
                dn = %distinguished_name,
                "service account bind refused, returning DN-only principal"
            );
            return Ok(Some(Principal::from_dn(distinguished_name, scope)));
        }
        return Err(Error::Server(format!(
            "service account bind failed: {err}"
        )));
    }

    let (object_class, attributes) = match scope.kind {
        PrincipalKind::User => {
            (&config.user_object_class, config.user_search_attributes())
        },
        PrincipalKind::Group => {
            (&config.group_object_class, config.group_search_attributes())
        },
    };
    let request = SearchRequest::base_object(
        distinguished_name,
        class_filter(object_class),
        attributes,
    );

    let entries = match conn.search(&request).await {
        Ok(entries) => entries,
        Err(DirectoryError::NoSuchObject) => {
            return Err(Error::NotFound(distinguished_name.to_string()));
        },
        Err(err) => {
            return Err(Error::Server(format!(
                "search for {distinguished_name} failed: {err}"
            )));
        },
    };

    if entries.is_empty() {
        return Err(Error::NotFound(distinguished_name.to_string()));
    }
    if entries.len() > 1 {
        return Err(Error::Server(
            "lookup by distinguished name found more than one result".into(),
        ));
    }

    let found = &entries[0];
    if !has_permission(found, config) {
        return Err(Error::PermissionDenied);
    }
    entry_for_scope(found, distinguished_name, scope, config)
}

/// Re-resolve the group memberships of a known principal outside a login
/// flow, e.g. to refresh a session's group set.
pub async fn refetch_group_principals<C>(
    conn: &mut C,
    principal_id: &str,
    config: &DirectoryConfig,
) -> Result<Vec<Principal>>
where
    C: DirectoryConnection + ?Sized,
{
    bind_service_account(conn, config).await.map_err(|err| {
        Error::Server(format!("service account bind failed: {err}"))
    })?;

    let (scope, distinguished_name) = parse_principal_id(principal_id)?;
    if scope.kind != PrincipalKind::User {
        return Err(Error::InvalidOption(format!(
            "cannot refetch groups for {principal_id:?}: not a user"
        )));
    }

    let request = SearchRequest::base_object(
        distinguished_name,
        class_filter(&config.user_object_class),
        config.user_search_attributes(),
    );
    let entries = search::search(conn, &request).await.map_err(|err| {
        Error::unauthorized(format!("user re-fetch failed: {err}"))
    })?;
    if entries.len() != 1 {
        return Err(Error::unauthorized(format!(
            "user re-fetch returned {} entries",
            entries.len()
        )));
    }

    let op_request = SearchRequest::base_object(
        &entries[0].dn,
        class_filter(&config.user_object_class),
        operational_attributes(),
    );
    let op_entries =
        search::search(conn, &op_request).await.map_err(|err| {
            Error::unauthorized(format!("operational re-fetch failed: {err}"))
        })?;
    if op_entries.is_empty() {
        return Err(Error::unauthorized("operational re-fetch found nothing"));
    }

    resolve_group_memberships(conn, config, &entries[0], &op_entries[0])
        .await
        .map_err(|err| {
            tracing::debug!(
                partial = err.partial.len(),
                "group refetch failed after partial resolution"
            );
            err.source
        })
}

/// Split a `scope://externalID` principal identifier.
pub fn parse_principal_id(principal_id: &str) -> Result<(PrincipalScope, &str)> {
    let (scope, external_id) =
        principal_id.split_once("://").ok_or_else(|| {
            Error::InvalidOption(format!(
                "malformed principal id {principal_id:?}"
            ))
        })?;
    Ok((scope.parse()?, external_id))
}

/// Privileged subtree search returning mapped principals.
///
/// Re-binds as the service account first: the connection's credentials may
/// have been superseded by a user bind. Entries that do not carry the
/// scope's object class are skipped rather than failing the whole scan.
pub(crate) async fn search_directory<C>(
    conn: &mut C,
    config: &DirectoryConfig,
    query: &str,
    scope: PrincipalScope,
) -> Result<Vec<Principal>>
where
    C: DirectoryConnection + ?Sized,
{
    let (base, attributes) = match scope.kind {
        PrincipalKind::User => {
            (config.user_search_base.as_str(), config.user_search_attributes())
        },
        PrincipalKind::Group => {
            (config.group_base(), config.group_search_attributes())
        },
    };

    bind_service_account(conn, config).await.map_err(|err| {
        Error::Server(format!("service account bind failed: {err}"))
    })?;

    let request = SearchRequest::whole_subtree(base, query, attributes);
    let entries =
        search::search_paged(conn, &request, config.search_page_size).await?;

    let mut principals = Vec::with_capacity(entries.len());
    for found in &entries {
        if let Some(principal) =
            entry_for_scope(found, &found.dn, scope, config)?
        {
            principals.push(principal);
        }
    }
    Ok(principals)
}

/// Map an entry, honoring external-IdP-style identifier configuration.
fn entry_for_scope(
    found: &ldap3::SearchEntry,
    distinguished_name: &str,
    scope: PrincipalScope,
    config: &DirectoryConfig,
) -> Result<Option<Principal>> {
    let mut external_id = distinguished_name;
    if config.use_login_external_id {
        let attr = match scope.kind {
            PrincipalKind::User => &config.user_login_attribute,
            PrincipalKind::Group => &config.group_dn_attribute,
        };
        if let Some(value) = first_attribute(found, attr) {
            // Only the first value is supported.
            external_id = value;
        }
    }
    crate::principal::entry_to_principal(found, external_id, scope, config)
}
