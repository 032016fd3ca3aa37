//! Principals and the entry-to-principal mapper.

use std::fmt;
use std::str::FromStr;

use ldap3::SearchEntry;
use serde::{Deserialize, Serialize};

use crate::config::DirectoryConfig;
use crate::error::{Error, Result};
use crate::filter::OBJECT_CLASS;

/// What a principal stands for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Group,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::User => "user",
            PrincipalKind::Group => "group",
        }
    }
}

/// Directory-server convention the configuration targets.
///
/// The variant selects the principal scope tags and, for
/// [`Provider::OpenLdap`], whether nested membership needs explicit
/// traversal (see [`crate::groups`]).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenLdap,
    FreeIpa,
    ActiveDirectory,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenLdap => "openldap",
            Provider::FreeIpa => "freeipa",
            Provider::ActiveDirectory => "activedirectory",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openldap" => Ok(Provider::OpenLdap),
            "freeipa" => Ok(Provider::FreeIpa),
            "activedirectory" => Ok(Provider::ActiveDirectory),
            _ => Err(Error::InvalidOption(format!("unknown provider {s:?}"))),
        }
    }
}

/// Scope tag selecting the attribute mapping and query strategy,
/// e.g. `openldap_user` or `freeipa_group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrincipalScope {
    pub provider: Provider,
    pub kind: PrincipalKind,
}

impl PrincipalScope {
    pub fn user(provider: Provider) -> Self {
        Self {
            provider,
            kind: PrincipalKind::User,
        }
    }

    pub fn group(provider: Provider) -> Self {
        Self {
            provider,
            kind: PrincipalKind::Group,
        }
    }

    /// Principal identifier for an entry in this scope.
    pub fn id_for(&self, external_id: &str) -> String {
        format!("{self}://{external_id}")
    }
}

impl fmt::Display for PrincipalScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.provider, self.kind.as_str())
    }
}

impl FromStr for PrincipalScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (provider, kind) = s
            .rsplit_once('_')
            .ok_or_else(|| Error::InvalidOption(format!("malformed scope {s:?}")))?;
        let kind = match kind {
            "user" => PrincipalKind::User,
            "group" => PrincipalKind::Group,
            _ => {
                return Err(Error::InvalidOption(format!(
                    "malformed scope {s:?}"
                )));
            },
        };
        Ok(Self {
            provider: provider.parse()?,
            kind,
        })
    }
}

/// A resolved directory identity.
///
/// `id` is `scope://externalID` and is stable for a given entry and scope;
/// equality of `id` is the sole deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub kind: PrincipalKind,
    pub display_name: String,
    pub login_name: String,
    pub provider: Provider,
}

impl Principal {
    /// Placeholder principal built from a distinguished name alone, for
    /// paths where the directory cannot be queried.
    pub fn from_dn(dn: &str, scope: PrincipalScope) -> Self {
        Self {
            id: scope.id_for(dn),
            kind: scope.kind,
            display_name: dn.to_string(),
            login_name: dn.to_string(),
            provider: scope.provider,
        }
    }

    /// The part of `id` after `scope://`, usually a distinguished name.
    pub fn external_id(&self) -> &str {
        self.id
            .split_once("://")
            .map(|(_, external_id)| external_id)
            .unwrap_or(&self.id)
    }
}

/// First value of the named attribute, if present.
pub fn first_attribute<'a>(entry: &'a SearchEntry, name: &str) -> Option<&'a str> {
    entry
        .attrs
        .get(name)
        .and_then(|values| values.first())
        .map(String::as_str)
}

/// All values of the named attribute; empty when absent.
pub fn attribute_values<'a>(entry: &'a SearchEntry, name: &str) -> &'a [String] {
    entry
        .attrs
        .get(name)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Whether the entry's `objectClass` values include `object_class`.
pub fn is_object_class(entry: &SearchEntry, object_class: &str) -> bool {
    entry.attrs.iter().any(|(name, values)| {
        name.eq_ignore_ascii_case(OBJECT_CLASS)
            && values
                .iter()
                .any(|value| value.eq_ignore_ascii_case(object_class))
    })
}

/// Map a raw entry to a [`Principal`].
///
/// Returns `Ok(None)` when the entry's object class does not match the
/// class expected for `scope`, so callers scanning heterogeneous result
/// sets are not aborted. Display and login names fall back to the
/// distinguished name when the configured attribute is absent.
pub fn entry_to_principal(
    entry: &SearchEntry,
    external_id: &str,
    scope: PrincipalScope,
    config: &DirectoryConfig,
) -> Result<Option<Principal>> {
    if external_id.is_empty() {
        return Err(Error::MissingRequired("externalID"));
    }

    let (expected_class, name_attr, login_attr) = match scope.kind {
        PrincipalKind::User => (
            &config.user_object_class,
            &config.user_name_attribute,
            &config.user_login_attribute,
        ),
        PrincipalKind::Group => (
            &config.group_object_class,
            &config.group_name_attribute,
            &config.group_name_attribute,
        ),
    };

    if !is_object_class(entry, expected_class) {
        tracing::debug!(
            dn = %entry.dn,
            class = %expected_class,
            "entry does not carry the expected object class"
        );
        return Ok(None);
    }

    let fallback = if entry.dn.is_empty() {
        external_id
    } else {
        entry.dn.as_str()
    };
    let display_name =
        first_attribute(entry, name_attr).unwrap_or(fallback).to_string();
    let login_name =
        first_attribute(entry, login_attr).unwrap_or(fallback).to_string();

    Ok(Some(Principal {
        id: scope.id_for(external_id),
        kind: scope.kind,
        display_name,
        login_name,
        provider: scope.provider,
    }))
}

/// Account-enabled check driven by the configured status attribute and
/// disabled bit mask (the `userAccountControl` convention).
///
/// Entries that are not user entries, and configurations without a status
/// attribute, always pass.
pub fn has_permission(entry: &SearchEntry, config: &DirectoryConfig) -> bool {
    if !is_object_class(entry, &config.user_object_class) {
        return true;
    }
    if config.user_enabled_attribute.is_empty()
        || config.user_disabled_bit_mask == 0
    {
        return true;
    }

    let Some(raw) = first_attribute(entry, &config.user_enabled_attribute)
    else {
        return true;
    };
    match raw.parse::<i64>() {
        Ok(status) => {
            status & config.user_disabled_bit_mask
                != config.user_disabled_bit_mask
        },
        Err(err) => {
            tracing::warn!(
                dn = %entry.dn,
                attribute = %config.user_enabled_attribute,
                error = %err,
                "account status attribute is not numeric"
            );
            false
        },
    }
}
