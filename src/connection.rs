//! Directory connection seam.
//!
//! The engine talks to the directory through [`DirectoryConnection`]: an
//! already-established handle whose ownership and teardown belong to the
//! caller. One connection serves one resolution flow; its authenticated
//! identity changes as the flow re-binds it, so it must never be shared
//! across concurrent flows.

use async_trait::async_trait;
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapError, SearchEntry};

use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use crate::search::SearchRequest;

const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_CREDENTIALS: u32 = 49;

/// A bound or unbound handle to the directory server.
#[async_trait]
pub trait DirectoryConnection: Send {
    /// Authenticate the connection as `dn`. Supersedes any prior bind.
    async fn bind(&mut self, dn: &str, password: &str)
    -> Result<(), DirectoryError>;

    async fn search(
        &mut self,
        request: &SearchRequest,
    ) -> Result<Vec<SearchEntry>, DirectoryError>;

    /// Like [`DirectoryConnection::search`], but follows continuation pages
    /// until exhaustion and returns the concatenated entry set.
    async fn search_paged(
        &mut self,
        request: &SearchRequest,
        page_size: i32,
    ) -> Result<Vec<SearchEntry>, DirectoryError>;

    async fn close(&mut self) -> Result<(), DirectoryError>;
}

/// Bind `conn` as the configured service account.
///
/// Callers re-issue this immediately before any query that depends on
/// service-account privilege, since a prior bind (e.g. as the end user)
/// supersedes the connection's credentials.
pub async fn bind_service_account<C>(
    conn: &mut C,
    config: &DirectoryConfig,
) -> Result<(), DirectoryError>
where
    C: DirectoryConnection + ?Sized,
{
    conn.bind(&config.service_account_dn, &config.service_account_password)
        .await
}

/// [`DirectoryConnection`] backed by an [`ldap3`] connection.
#[derive(Debug, Clone)]
pub struct LdapHandle {
    conn: Ldap,
}

impl LdapHandle {
    /// Open a new connection to `addr` (e.g. `ldap://127.0.0.1:389`).
    ///
    /// TLS settings and trust material are the caller's concern; use
    /// [`LdapHandle::from_ldap`] for connections with custom settings.
    pub async fn connect(addr: &str) -> Result<Self, DirectoryError> {
        let (handle, conn) = LdapConnAsync::new(addr).await?;
        ldap3::drive!(handle);
        Ok(Self { conn })
    }

    /// Wrap an already-established [`ldap3::Ldap`] handle.
    pub fn from_ldap(conn: Ldap) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DirectoryConnection for LdapHandle {
    async fn bind(
        &mut self,
        dn: &str,
        password: &str,
    ) -> Result<(), DirectoryError> {
        self.conn
            .simple_bind(dn, password)
            .await
            .map_err(classify)?
            .success()
            .map_err(classify)?;
        Ok(())
    }

    async fn search(
        &mut self,
        request: &SearchRequest,
    ) -> Result<Vec<SearchEntry>, DirectoryError> {
        let (entries, _) = self
            .conn
            .search(
                &request.base_dn,
                request.scope,
                &request.filter,
                request.attributes.clone(),
            )
            .await
            .map_err(classify)?
            .success()
            .map_err(classify)?;

        Ok(entries.into_iter().map(SearchEntry::construct).collect())
    }

    async fn search_paged(
        &mut self,
        request: &SearchRequest,
        page_size: i32,
    ) -> Result<Vec<SearchEntry>, DirectoryError> {
        let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResults::new(page_size)),
        ];

        let mut stream = self
            .conn
            .streaming_search_with(
                adapters,
                &request.base_dn,
                request.scope,
                &request.filter,
                request.attributes.clone(),
            )
            .await
            .map_err(classify)?;

        let mut entries = Vec::new();
        while let Some(result_entry) = stream.next().await.map_err(classify)? {
            entries.push(SearchEntry::construct(result_entry));
        }
        stream.finish().await.success().map_err(classify)?;

        Ok(entries)
    }

    async fn close(&mut self) -> Result<(), DirectoryError> {
        self.conn.unbind().await.map_err(classify)?;
        Ok(())
    }
}

fn classify(err: LdapError) -> DirectoryError {
    if let LdapError::LdapResult { result } = &err {
        match result.rc {
            RC_INVALID_CREDENTIALS => {
                return DirectoryError::InvalidCredentials;
            },
            RC_NO_SUCH_OBJECT => return DirectoryError::NoSuchObject,
            _ => {},
        }
    }
    DirectoryError::Ldap(err)
}
