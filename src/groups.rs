//! Group membership resolution.
//!
//! Directories disagree on how membership is represented: a forward
//! "memberOf" attribute on the user, a reverse "member" attribute on the
//! group, or operational attributes only populated on request. Resolution
//! tries a fixed sequence of strategies over the user's entry and its
//! operational snapshot, deduplicating by principal id throughout:
//!
//! 1. forward membership, resolved by batched group queries;
//! 2. a reverse cross-check keyed by the user's membership-by-value key;
//! 3. a fallback reverse query by the user's own DN when nothing matched;
//! 4. an upward worklist traversal for nested groups where the directory
//!    does not flatten them server-side.

use std::collections::{HashSet, VecDeque};

use ldap3::SearchEntry;
use thiserror::Error;

use crate::config::DirectoryConfig;
use crate::connection::DirectoryConnection;
use crate::error::Error;
use crate::filter::{attr_equals, class_filter};
use crate::lookup::search_directory;
use crate::principal::{
    Principal, PrincipalScope, Provider, attribute_values,
};

/// Resolution failure carrying the groups gathered before the error.
///
/// The caller decides whether the partial set is usable.
#[derive(Debug, Error)]
#[error("group membership resolution failed")]
pub struct MembershipError {
    pub partial: Vec<Principal>,
    #[source]
    pub source: Error,
}

/// Resolve the deduplicated, transitively-closed group set for an
/// authenticated user.
///
/// `entry` is the user's primary entry from the login search; `op_entry`
/// is its operational-attribute snapshot. Order of the returned set is not
/// significant.
pub async fn resolve_group_memberships<C>(
    conn: &mut C,
    config: &DirectoryConfig,
    entry: &SearchEntry,
    op_entry: &SearchEntry,
) -> Result<Vec<Principal>, MembershipError>
where
    C: DirectoryConnection + ?Sized,
{
    let group_scope = PrincipalScope::group(config.provider);
    let mut groups: Vec<Principal> = Vec::new();

    // Forward membership values are group identifiers, not objects: the
    // user may lack read access to the group entries, so they are resolved
    // by privileged query rather than trusted as principals.
    let mut forward = attribute_values(entry, &config.user_member_attribute);
    if forward.is_empty() {
        forward = attribute_values(op_entry, &config.user_member_attribute);
    }
    tracing::debug!(
        count = forward.len(),
        attribute = %config.user_member_attribute,
        "forward membership values"
    );

    let batch_size = config.search_batch_size.max(1);
    for batch in forward.chunks(batch_size) {
        let mut clauses = String::new();
        for group_dn in batch {
            clauses.push_str(&attr_equals(&config.group_dn_attribute, group_dn));
        }
        let query = format!(
            "(&{}(|{}))",
            class_filter(&config.group_object_class),
            clauses,
        );

        match search_directory(conn, config, &query, group_scope).await {
            Ok(found) => {
                let fresh = non_duplicates(found, &groups);
                groups.extend(fresh);
            },
            Err(source) => {
                return Err(MembershipError {
                    partial: groups,
                    source,
                });
            },
        }
    }
    if !forward.is_empty() {
        tracing::debug!(
            batches = forward.len().div_ceil(batch_size),
            resolved = groups.len(),
            "forward membership resolved"
        );
    }

    // Reverse cross-check: only the first value of the membership-by-value
    // key is authoritative.
    let mut member_key =
        attribute_values(entry, &config.group_member_user_attribute);
    if member_key.is_empty() {
        member_key =
            attribute_values(op_entry, &config.group_member_user_attribute);
    }
    if let Some(value) = member_key.first() {
        let query = format!(
            "(&{}{})",
            attr_equals(&config.group_member_mapping_attribute, value),
            class_filter(&config.group_object_class),
        );

        match search_directory(conn, config, &query, group_scope).await {
            Ok(found) => {
                let fresh = non_duplicates(found, &groups);
                tracing::debug!(
                    added = fresh.len(),
                    "reverse membership cross-check"
                );
                groups.extend(fresh);
            },
            Err(source) => {
                return Err(MembershipError {
                    partial: groups,
                    source,
                });
            },
        }
    }

    // Entries without a retrievable canonical identifier expose neither
    // attribute usefully; a single reverse query by the user's own DN
    // returns direct membership only, and nested chains are gathered below.
    let mut fallback_mode = false;
    if groups.is_empty() {
        tracing::debug!(
            "no membership attribute usable, querying groups by member DN"
        );
        let query = format!(
            "(&{}{})",
            attr_equals(&config.group_member_mapping_attribute, &entry.dn),
            class_filter(&config.group_object_class),
        );

        match search_directory(conn, config, &query, group_scope).await {
            Ok(found) => groups = found,
            Err(source) => {
                return Err(MembershipError {
                    partial: groups,
                    source,
                });
            },
        }
        fallback_mode = true;
    }

    // Directories that flatten nested groups into the operational snapshot
    // are already covered; reverse-attribute directories need an explicit
    // upward traversal.
    if config.nested_group_membership_enabled
        && (config.provider == Provider::OpenLdap || fallback_mode)
    {
        gather_parent_groups(conn, config, &mut groups).await;
    }

    Ok(groups)
}

/// Worklist traversal up the membership graph: for every known group, find
/// the groups it is itself a member of, until no new parent appears.
///
/// The visited set is keyed by principal id, which bounds the traversal on
/// cyclic or redundant group graphs. Parent lookups are best-effort: a
/// failed query is logged and the traversal moves on with what it has.
async fn gather_parent_groups<C>(
    conn: &mut C,
    config: &DirectoryConfig,
    groups: &mut Vec<Principal>,
) where
    C: DirectoryConnection + ?Sized,
{
    let group_scope = PrincipalScope::group(config.provider);
    let mut visited: HashSet<String> = HashSet::new();
    let mut worklist: VecDeque<Principal> = groups.iter().cloned().collect();

    while let Some(group) = worklist.pop_front() {
        if !visited.insert(group.id.clone()) {
            continue;
        }

        let query = format!(
            "(&{}{})",
            attr_equals(
                &config.group_member_mapping_attribute,
                group.external_id(),
            ),
            class_filter(&config.group_object_class),
        );

        let parents =
            match search_directory(conn, config, &query, group_scope).await {
                Ok(parents) => parents,
                Err(err) => {
                    tracing::warn!(
                        group = %group.id,
                        error = %err,
                        "parent group lookup failed, keeping groups gathered so far"
                    );
                    continue;
                },
            };

        for parent in non_duplicates(parents, groups) {
            worklist.push_back(parent.clone());
            groups.push(parent);
        }
    }

    tracing::debug!(
        total = groups.len(),
        visited = visited.len(),
        "nested group traversal complete"
    );
}

/// Principals from `candidates` not already present in `existing`,
/// first seen wins.
fn non_duplicates(
    candidates: Vec<Principal>,
    existing: &[Principal],
) -> Vec<Principal> {
    let mut fresh: Vec<Principal> = Vec::new();
    for candidate in candidates {
        let seen = existing
            .iter()
            .chain(fresh.iter())
            .any(|principal| principal.id == candidate.id);
        if !seen {
            fresh.push(candidate);
        }
    }
    fresh
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::connection::testing::{FakeDirectory, entry, test_config};

    fn group_entry(name: &str) -> SearchEntry {
        entry(
            &format!("cn={name},ou=groups,dc=x"),
            &[("objectClass", &["groupOfNames"]), ("cn", &[name])],
        )
    }

    fn user_entry(attrs: &[(&str, &[&str])]) -> SearchEntry {
        let mut all: Vec<(&str, &[&str])> =
            vec![("objectClass", &["inetOrgPerson"]), ("uid", &["alice"])];
        all.extend_from_slice(attrs);
        entry("uid=alice,ou=people,dc=x", &all)
    }

    fn group_ids(groups: &[Principal]) -> Vec<&str> {
        let mut ids: Vec<&str> =
            groups.iter().map(|g| g.id.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    #[tokio::test]
    async fn test_forward_membership_single_group() {
        let user = user_entry(&[(
            "memberOf",
            &["cn=eng,ou=groups,dc=x"],
        )]);
        let op = user_entry(&[]);
        let mut conn = FakeDirectory::with_service_account()
            .rule("entryDN=cn=eng", vec![group_entry("eng")]);

        let groups = resolve_group_memberships(
            &mut conn,
            &test_config(),
            &user,
            &op,
        )
        .await
        .unwrap();

        assert_eq!(
            group_ids(&groups),
            vec!["openldap_group://cn=eng,ou=groups,dc=x"]
        );
    }

    #[tokio::test]
    async fn test_forward_membership_from_operational_snapshot() {
        let user = user_entry(&[]);
        let op = user_entry(&[("memberOf", &["cn=ops,ou=groups,dc=x"])]);
        let mut conn = FakeDirectory::with_service_account()
            .rule("entryDN=cn=ops", vec![group_entry("ops")]);

        let groups = resolve_group_memberships(
            &mut conn,
            &test_config(),
            &user,
            &op,
        )
        .await
        .unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].display_name, "ops");
    }

    #[tokio::test]
    async fn test_reverse_cross_check_deduplicates() {
        // Forward step yields nothing; the membership-by-value key points
        // at two groups.
        let user = user_entry(&[("entryDN", &["alice-uid"])]);
        let op = user_entry(&[]);
        let mut conn = FakeDirectory::with_service_account().rule(
            "member=alice-uid",
            vec![group_entry("eng"), group_entry("ops"), group_entry("eng")],
        );

        let groups = resolve_group_memberships(
            &mut conn,
            &test_config(),
            &user,
            &op,
        )
        .await
        .unwrap();

        assert_eq!(
            group_ids(&groups),
            vec![
                "openldap_group://cn=eng,ou=groups,dc=x",
                "openldap_group://cn=ops,ou=groups,dc=x",
            ]
        );
    }

    #[tokio::test]
    async fn test_fallback_by_user_dn_without_nesting() {
        // Neither forward nor reverse attributes are usable; nested
        // resolution is disabled, so the fallback's direct membership is
        // the whole answer.
        let user = user_entry(&[]);
        let op = user_entry(&[]);
        let mut conn = FakeDirectory::with_service_account()
            .rule("member=uid=alice,ou=people", vec![group_entry("lone")])
            .rule("member=cn=lone", vec![group_entry("parent")]);

        let groups = resolve_group_memberships(
            &mut conn,
            &test_config(),
            &user,
            &op,
        )
        .await
        .unwrap();

        assert_eq!(
            group_ids(&groups),
            vec!["openldap_group://cn=lone,ou=groups,dc=x"]
        );
    }

    #[tokio::test]
    async fn test_fallback_with_nesting_gathers_parents() {
        let user = user_entry(&[]);
        let op = user_entry(&[]);
        let mut config = test_config();
        config.nested_group_membership_enabled = true;

        let mut conn = FakeDirectory::with_service_account()
            .rule("member=uid=alice,ou=people", vec![group_entry("lone")])
            .rule("member=cn=lone", vec![group_entry("parent")]);

        let groups =
            resolve_group_memberships(&mut conn, &config, &user, &op)
                .await
                .unwrap();

        assert_eq!(
            group_ids(&groups),
            vec![
                "openldap_group://cn=lone,ou=groups,dc=x",
                "openldap_group://cn=parent,ou=groups,dc=x",
            ]
        );
    }

    #[tokio::test]
    async fn test_nested_traversal_terminates_on_cycles() {
        // a is member of b, b is member of a.
        let user = user_entry(&[("memberOf", &["cn=a,ou=groups,dc=x"])]);
        let op = user_entry(&[]);
        let mut config = test_config();
        config.nested_group_membership_enabled = true;

        let mut conn = FakeDirectory::with_service_account()
            .rule("entryDN=cn=a", vec![group_entry("a")])
            .rule("member=cn=a,ou=groups", vec![group_entry("b")])
            .rule("member=cn=b,ou=groups", vec![group_entry("a")]);

        let groups =
            resolve_group_memberships(&mut conn, &config, &user, &op)
                .await
                .unwrap();

        assert_eq!(
            group_ids(&groups),
            vec![
                "openldap_group://cn=a,ou=groups,dc=x",
                "openldap_group://cn=b,ou=groups,dc=x",
            ]
        );
    }

    #[tokio::test]
    async fn test_forward_membership_batches() {
        let dns: Vec<String> = (0..120)
            .map(|i| format!("cn=g{i:03},ou=groups,dc=x"))
            .collect();
        let dn_refs: Vec<&str> = dns.iter().map(String::as_str).collect();
        let user = user_entry(&[("memberOf", &dn_refs)]);
        let op = user_entry(&[]);

        // The third batch re-returns g000 to prove cross-batch dedup.
        let mut conn = FakeDirectory::with_service_account()
            .rule(
                "entryDN=cn=g000",
                (0..50).map(|i| group_entry(&format!("g{i:03}"))).collect(),
            )
            .rule(
                "entryDN=cn=g050",
                (50..100).map(|i| group_entry(&format!("g{i:03}"))).collect(),
            )
            .rule("entryDN=cn=g100", {
                let mut entries: Vec<SearchEntry> = (100..120)
                    .map(|i| group_entry(&format!("g{i:03}")))
                    .collect();
                entries.push(group_entry("g000"));
                entries
            });

        let groups = resolve_group_memberships(
            &mut conn,
            &test_config(),
            &user,
            &op,
        )
        .await
        .unwrap();

        assert_eq!(groups.len(), 120);
        assert_eq!(conn.searches_containing("entryDN=").len(), 3);

        let unique: HashSet<&str> =
            groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(unique.len(), 120);
    }

    #[tokio::test]
    async fn test_reverse_failure_returns_partial() {
        let user = user_entry(&[
            ("memberOf", &["cn=eng,ou=groups,dc=x"]),
            ("entryDN", &["alice-uid"]),
        ]);
        let op = user_entry(&[]);
        let mut conn = FakeDirectory::with_service_account()
            .rule("entryDN=cn=eng", vec![group_entry("eng")])
            .fail_on("member=alice-uid");

        let err = resolve_group_memberships(
            &mut conn,
            &test_config(),
            &user,
            &op,
        )
        .await
        .unwrap_err();

        assert_eq!(err.partial.len(), 1);
        assert_eq!(err.partial[0].display_name, "eng");
    }

    #[tokio::test]
    async fn test_nested_traversal_failure_is_best_effort() {
        let user = user_entry(&[("memberOf", &["cn=a,ou=groups,dc=x"])]);
        let op = user_entry(&[]);
        let mut config = test_config();
        config.nested_group_membership_enabled = true;

        let mut conn = FakeDirectory::with_service_account()
            .rule("entryDN=cn=a", vec![group_entry("a")])
            .fail_on("member=cn=a,ou=groups");

        let groups =
            resolve_group_memberships(&mut conn, &config, &user, &op)
                .await
                .unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].display_name, "a");
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent() {
        let user = user_entry(&[
            ("memberOf", &["cn=eng,ou=groups,dc=x"]),
            ("entryDN", &["alice-uid"]),
        ]);
        let op = user_entry(&[]);
        let config = test_config();

        let mut first_groups = Vec::new();
        let mut second_groups = Vec::new();
        for groups in [&mut first_groups, &mut second_groups] {
            let mut conn = FakeDirectory::with_service_account()
                .rule("entryDN=cn=eng", vec![group_entry("eng")])
                .rule(
                    "member=alice-uid",
                    vec![group_entry("eng"), group_entry("ops")],
                );
            *groups = resolve_group_memberships(
                &mut conn, &config, &user, &op,
            )
            .await
            .unwrap();
        }

        assert_eq!(group_ids(&first_groups), group_ids(&second_groups));
    }

    #[tokio::test]
    async fn test_service_account_rebind_precedes_each_query() {
        let user = user_entry(&[("memberOf", &["cn=eng,ou=groups,dc=x"])]);
        let op = user_entry(&[]);
        let mut conn = FakeDirectory::with_service_account()
            .rule("entryDN=cn=eng", vec![group_entry("eng")]);

        resolve_group_memberships(&mut conn, &test_config(), &user, &op)
            .await
            .unwrap();

        assert_eq!(conn.binds.len(), conn.searches.len());
        assert!(conn.binds.iter().all(|dn| dn == "cn=admin,dc=x"));
    }
}
