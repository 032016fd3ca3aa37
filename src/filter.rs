//! Injection-safe search filter construction.

use std::borrow::Cow;

use ldap3::ldap_escape;

use crate::error::{Error, Result};

pub const OBJECT_CLASS: &str = "objectClass";

/// Escape a value interpolated into a search filter (RFC 4515).
///
/// Metacharacters (`*`, `(`, `)`, `\`, NUL) become hex escapes, so values
/// taken from user input or from prior search results are always matched
/// literally.
pub fn escape_value(value: &str) -> Cow<'_, str> {
    ldap_escape(value)
}

/// Strip characters outside the attribute-description grammar.
///
/// Attribute names come from configuration and are interpolated unescaped,
/// so anything that is not a descriptor character is dropped.
pub fn sanitize_attr(attr: &str) -> String {
    attr.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ';'))
        .collect()
}

/// `(objectClass=<class>)` with the class name sanitized.
pub fn class_filter(object_class: &str) -> String {
    format!("({OBJECT_CLASS}={})", sanitize_attr(object_class))
}

/// `(<attr>=<value>)` with the attribute sanitized and the value escaped.
pub fn attr_equals(attr: &str, value: &str) -> String {
    format!("({}={})", sanitize_attr(attr), escape_value(value))
}

/// Check a configured filter fragment for RFC 4515 well-formedness.
///
/// Overrides such as `userLoginFilter` are concatenated verbatim into
/// generated filters, so a malformed fragment is rejected up front with
/// [`Error::InvalidOption`] instead of being sent to the server.
pub fn validate_filter(filter: &str) -> Result<()> {
    let bytes = filter.as_bytes();
    let mut pos = 0usize;

    parse_filter(bytes, &mut pos).map_err(|reason| {
        Error::InvalidOption(format!("malformed filter {filter:?}: {reason}"))
    })?;

    if pos != bytes.len() {
        return Err(Error::InvalidOption(format!(
            "malformed filter {filter:?}: trailing characters"
        )));
    }
    Ok(())
}

fn parse_filter(
    bytes: &[u8],
    pos: &mut usize,
) -> std::result::Result<(), &'static str> {
    if bytes.get(*pos) != Some(&b'(') {
        return Err("expected '('");
    }
    *pos += 1;

    match bytes.get(*pos) {
        Some(b'&') | Some(b'|') => {
            *pos += 1;
            if bytes.get(*pos) != Some(&b'(') {
                return Err("expected at least one nested filter");
            }
            while bytes.get(*pos) == Some(&b'(') {
                parse_filter(bytes, pos)?;
            }
        },
        Some(b'!') => {
            *pos += 1;
            parse_filter(bytes, pos)?;
        },
        _ => parse_item(bytes, pos)?,
    }

    if bytes.get(*pos) != Some(&b')') {
        return Err("expected ')'");
    }
    *pos += 1;
    Ok(())
}

fn parse_item(
    bytes: &[u8],
    pos: &mut usize,
) -> std::result::Result<(), &'static str> {
    let start = *pos;
    while let Some(&c) = bytes.get(*pos) {
        if matches!(c, b'=' | b'<' | b'>' | b'~') {
            break;
        }
        if matches!(c, b'(' | b')') {
            return Err("unexpected parenthesis in attribute description");
        }
        *pos += 1;
    }
    if *pos == start {
        return Err("empty attribute description");
    }

    match bytes.get(*pos) {
        Some(b'=') => *pos += 1,
        Some(b'<') | Some(b'>') | Some(b'~') => {
            *pos += 1;
            if bytes.get(*pos) != Some(&b'=') {
                return Err("expected '='");
            }
            *pos += 1;
        },
        _ => return Err("missing '='"),
    }

    while let Some(&c) = bytes.get(*pos) {
        match c {
            b')' => break,
            b'(' => return Err("unexpected '(' in assertion value"),
            b'\\' => {
                let valid = bytes
                    .get(*pos + 1)
                    .zip(bytes.get(*pos + 2))
                    .is_some_and(|(hi, lo)| {
                        hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit()
                    });
                if !valid {
                    return Err("invalid escape in assertion value");
                }
                *pos += 3;
            },
            _ => *pos += 1,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_metacharacters() {
        assert_eq!(escape_value(r"ali*ce)(\"), r"ali\2ace\29\28\5c");
        assert_eq!(escape_value("alice"), "alice");
    }

    #[test]
    fn test_sanitize_attr() {
        assert_eq!(sanitize_attr("memberOf"), "memberOf");
        assert_eq!(sanitize_attr("entryDN;binary"), "entryDN;binary");
        assert_eq!(sanitize_attr("cn=*)(evil"), "cnevil");
        assert_eq!(sanitize_attr("2.5.4.3"), "2.5.4.3");
    }

    #[test]
    fn test_attr_equals_is_injection_safe() {
        let clause = attr_equals("uid", "x*)(uid=*");
        assert_eq!(clause, r"(uid=x\2a\29\28uid=\2a)");
    }

    #[test]
    fn test_validate_filter_accepts_well_formed() {
        for ok in [
            "(objectClass=person)",
            "(cn=)",
            "(cn=alice*)",
            "(&(objectClass=person)(uid=alice))",
            "(|(uid=a)(uid=b))",
            "(!(memberOf=cn=eng,dc=x))",
            "(uidNumber>=1000)",
            "(&(a=b)(|(c=d)(e~=f)))",
            r"(cn=esc\2aaped)",
        ] {
            assert!(validate_filter(ok).is_ok(), "rejected {ok}");
        }
    }

    #[test]
    fn test_validate_filter_rejects_malformed() {
        for bad in [
            "",
            "objectClass=person",
            "((uid=a)",
            "(uid=a))",
            "(&)",
            "(uid)",
            "(=value)",
            "(uid=a)(uid=b)",
            r"(cn=bad\zzescape)",
            "(uid=a(b))",
        ] {
            let err = validate_filter(bad);
            assert!(
                matches!(err, Err(Error::InvalidOption(_))),
                "accepted {bad:?}"
            );
        }
    }
}
