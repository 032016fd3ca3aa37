//! Directory configuration.

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter::OBJECT_CLASS;
use crate::principal::Provider;

pub const DEFAULT_SEARCH_BATCH_SIZE: usize = 50;
pub const DEFAULT_SEARCH_PAGE_SIZE: i32 = 1000;

/// Attribute bindings, search bases and flags for one directory server.
///
/// Loaded once per resolution request from an external configuration store
/// and treated as immutable for the duration of one login or search call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Whether this provider is enabled for authentication.
    pub enabled: bool,
    /// Directory-server convention, selects scope tags and query strategy.
    pub provider: Provider,

    /// DN used for privileged reads.
    pub service_account_dn: String,
    #[serde(skip_serializing)]
    pub service_account_password: String,

    pub user_search_base: String,
    /// Falls back to `user_search_base` when empty.
    pub group_search_base: String,

    pub user_object_class: String,
    pub group_object_class: String,
    /// Attribute holding the login name.
    pub user_login_attribute: String,
    /// Attribute holding the display name.
    pub user_name_attribute: String,
    /// Forward membership attribute on user entries ("memberOf" style).
    pub user_member_attribute: String,
    /// Account status attribute; empty disables the check.
    pub user_enabled_attribute: String,
    pub user_disabled_bit_mask: i64,

    /// Extra clause appended to the login search; validated before use.
    pub user_login_filter: String,
    /// Extra clause appended to ad hoc user searches; validated before use.
    pub user_search_filter: String,
    /// Pipe-delimited attribute list matched by ad hoc user searches.
    pub user_search_attribute: String,

    /// Attribute carrying a group entry's canonical identifier.
    pub group_dn_attribute: String,
    /// Attribute on the user entry holding its membership-by-value key.
    pub group_member_user_attribute: String,
    /// Reverse membership attribute on group entries ("member" style).
    pub group_member_mapping_attribute: String,
    pub group_name_attribute: String,
    /// Attribute matched by ad hoc group searches.
    pub group_search_attribute: String,
    /// Extra clause appended to ad hoc group searches; validated before use.
    pub group_search_filter: String,

    pub nested_group_membership_enabled: bool,
    /// Re-establish the service-account bind for reads after the user bind.
    pub search_using_service_account: bool,
    /// Use login/identifier attribute values as external ids instead of
    /// distinguished names (external-IdP-style lookups).
    pub use_login_external_id: bool,

    /// Handed unchanged to the access-control collaborator.
    pub access_mode: String,
    pub allowed_principal_ids: Vec<String>,

    /// Forward-member DNs resolved per query.
    pub search_batch_size: usize,
    /// Page size for subtree searches.
    pub search_page_size: i32,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: Provider::default(),
            service_account_dn: String::new(),
            service_account_password: String::new(),
            user_search_base: String::new(),
            group_search_base: String::new(),
            user_object_class: "inetOrgPerson".into(),
            group_object_class: "groupOfNames".into(),
            user_login_attribute: "uid".into(),
            user_name_attribute: "cn".into(),
            user_member_attribute: "memberOf".into(),
            user_enabled_attribute: String::new(),
            user_disabled_bit_mask: 0,
            user_login_filter: String::new(),
            user_search_filter: String::new(),
            user_search_attribute: "uid|sn|givenName".into(),
            group_dn_attribute: "entryDN".into(),
            group_member_user_attribute: "entryDN".into(),
            group_member_mapping_attribute: "member".into(),
            group_name_attribute: "cn".into(),
            group_search_attribute: "cn".into(),
            group_search_filter: String::new(),
            nested_group_membership_enabled: false,
            search_using_service_account: false,
            use_login_external_id: false,
            access_mode: "unrestricted".into(),
            allowed_principal_ids: Vec::new(),
            search_batch_size: DEFAULT_SEARCH_BATCH_SIZE,
            search_page_size: DEFAULT_SEARCH_PAGE_SIZE,
        }
    }
}

impl DirectoryConfig {
    /// Read a configuration from a YAML file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|err| {
            tracing::error!(error = %err, "directory configuration not found");
            Error::Server(format!("cannot open directory configuration: {err}"))
        })?;

        serde_yaml::from_reader(file).map_err(|err| {
            Error::Server(format!("cannot parse directory configuration: {err}"))
        })
    }

    /// Base DN for group queries, falling back to the user base.
    pub fn group_base(&self) -> &str {
        if self.group_search_base.is_empty() {
            &self.user_search_base
        } else {
            &self.group_search_base
        }
    }

    /// Attributes requested when searching user entries.
    pub fn user_search_attributes(&self) -> Vec<String> {
        let mut attrs = vec![
            OBJECT_CLASS.to_string(),
            self.user_login_attribute.clone(),
            self.user_name_attribute.clone(),
            self.user_member_attribute.clone(),
            self.group_member_user_attribute.clone(),
        ];
        if !self.user_enabled_attribute.is_empty() {
            attrs.push(self.user_enabled_attribute.clone());
        }
        attrs
    }

    /// Attributes requested when searching group entries.
    pub fn group_search_attributes(&self) -> Vec<String> {
        vec![
            OBJECT_CLASS.to_string(),
            self.group_name_attribute.clone(),
            self.group_search_attribute.clone(),
            self.group_dn_attribute.clone(),
            self.group_member_mapping_attribute.clone(),
            self.group_member_user_attribute.clone(),
        ]
    }
}
