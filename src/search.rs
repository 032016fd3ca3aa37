//! Search request shaping and execution.

use ldap3::{Scope, SearchEntry};

use crate::connection::DirectoryConnection;
use crate::error::DirectoryError;

/// Reserved markers requesting server-computed attributes.
///
/// Some directories only populate virtual membership attributes when the
/// query asks for operational attributes explicitly.
pub const OPERATIONAL_ATTRIBUTES: [&str; 3] = ["1.1", "+", "*"];

/// One directory query, constructed and consumed within a single call.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: Scope,
    pub filter: String,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    /// Single-entry query, no recursion.
    pub fn base_object(
        base_dn: impl Into<String>,
        filter: impl Into<String>,
        attributes: Vec<String>,
    ) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope: Scope::Base,
            filter: filter.into(),
            attributes,
        }
    }

    /// Recursive query over the whole subtree.
    pub fn whole_subtree(
        base_dn: impl Into<String>,
        filter: impl Into<String>,
        attributes: Vec<String>,
    ) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope: Scope::Subtree,
            filter: filter.into(),
            attributes,
        }
    }
}

pub fn operational_attributes() -> Vec<String> {
    OPERATIONAL_ATTRIBUTES.iter().map(|s| s.to_string()).collect()
}

/// Execute a request, treating a missing base object as zero entries.
pub async fn search<C>(
    conn: &mut C,
    request: &SearchRequest,
) -> Result<Vec<SearchEntry>, DirectoryError>
where
    C: DirectoryConnection + ?Sized,
{
    absorb_missing(conn.search(request).await)
}

/// Paginated variant of [`search`], following continuation pages until
/// exhaustion.
pub async fn search_paged<C>(
    conn: &mut C,
    request: &SearchRequest,
    page_size: i32,
) -> Result<Vec<SearchEntry>, DirectoryError>
where
    C: DirectoryConnection + ?Sized,
{
    absorb_missing(conn.search_paged(request, page_size).await)
}

fn absorb_missing(
    result: Result<Vec<SearchEntry>, DirectoryError>,
) -> Result<Vec<SearchEntry>, DirectoryError> {
    match result {
        Err(DirectoryError::NoSuchObject) => Ok(Vec::new()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{entry, FakeDirectory};

    #[tokio::test]
    async fn test_no_such_object_is_empty() {
        let mut conn =
            FakeDirectory::new().missing_on("ou=nowhere");

        let request = SearchRequest::whole_subtree(
            "dc=x",
            "(ou=nowhere)",
            vec!["cn".into()],
        );
        let entries = search(&mut conn, &request).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_other_errors_surface() {
        let mut conn = FakeDirectory::new().fail_on("(cn=boom)");

        let request =
            SearchRequest::whole_subtree("dc=x", "(cn=boom)", Vec::new());
        assert!(search(&mut conn, &request).await.is_err());
    }

    #[tokio::test]
    async fn test_entries_pass_through() {
        let mut conn = FakeDirectory::new().rule(
            "(cn=eng)",
            vec![entry("cn=eng,dc=x", &[("cn", &["eng"])])],
        );

        let request =
            SearchRequest::whole_subtree("dc=x", "(cn=eng)", Vec::new());
        let entries = search_paged(&mut conn, &request, 1000).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dn, "cn=eng,dc=x");
    }
}
