use std::sync::Arc;

use crate::{
    collection::Collection,
    document::Document,
    error::{DbError, Result},
    skiplist::SkipList,
};

/// Inclusive upper bound used when an interval omits its right endpoint:
/// the maximum Unicode scalar value sorts after every valid document name.
pub const MAX_INTERVAL_KEY: char = '\u{10FFFF}';

/// Split a request path into its segments after the `/v1/` prefix. The
/// trailing segment may be empty (a trailing slash designates a collection);
/// interior empty segments are rejected later by the resolver.
pub fn parse_segments(path: &str) -> Result<Vec<String>> {
    let mut parts = path.split('/');
    match parts.next() {
        Some("") => {}
        _ => {
            return Err(DbError::BadPath(
                "invalid path, path should start with the form '/v1/...'".to_string(),
            ));
        }
    }
    match parts.next() {
        Some("v1") => {}
        _ => {
            return Err(DbError::BadPath(
                "invalid path, path should start with the form '/v1/...'".to_string(),
            ));
        }
    }

    let segments: Vec<String> = parts.map(str::to_string).collect();
    if segments.is_empty() {
        return Err(DbError::BadPath(
            "invalid path, no database specified".to_string(),
        ));
    }
    Ok(segments)
}

/// Outcome of walking the hierarchy along a parsed path: the deepest nodes
/// that resolved, whether the walk stopped while expecting a collection, and
/// the index of the deepest segment that resolved (-1 when even the database
/// is absent).
pub struct Resolved {
    pub ends_on_collection: bool,
    pub last_doc: Option<Arc<Document>>,
    pub last_col: Option<Arc<Collection>>,
    pub last_good: isize,
}

/// Walk the hierarchy segment by segment, alternating collection and
/// document lookups. Odd segment counts greater than one are structurally
/// invalid; interior empty segments are rejected.
pub fn resolve_deepest(
    databases: &SkipList<Arc<Collection>>,
    segments: &[String],
) -> Result<Resolved> {
    let mut col_last_found = false;
    let mut cur_col: Option<Arc<Collection>> = None;
    let mut cur_doc: Option<Arc<Document>> = None;

    if segments.len() > 1 && segments.len() % 2 == 1 {
        return Err(DbError::BadPath("bad path".to_string()));
    }

    for (i, name) in segments.iter().enumerate() {
        if (i != segments.len() - 1 || i == 0) && name.is_empty() {
            return Err(DbError::BadPath("// not allowed".to_string()));
        }

        if !col_last_found {
            let col = match &cur_doc {
                None => databases.get(name),
                Some(doc) => doc.find_collection(name),
            };
            match col {
                Some(col) => {
                    cur_col = Some(col);
                    col_last_found = true;
                }
                None => {
                    return Ok(Resolved {
                        ends_on_collection: false,
                        last_doc: cur_doc,
                        last_col: None,
                        last_good: i as isize - 1,
                    });
                }
            }
        } else {
            let col = cur_col.as_ref().ok_or_else(|| {
                DbError::Internal("resolver lost its collection".to_string())
            })?;
            match col.find_document(name) {
                Some(doc) => {
                    cur_doc = Some(doc);
                    col_last_found = false;
                }
                None => {
                    return Ok(Resolved {
                        ends_on_collection: true,
                        last_doc: cur_doc,
                        last_col: cur_col,
                        last_good: i as isize - 1,
                    });
                }
            }
        }
    }

    Ok(Resolved {
        ends_on_collection: col_last_found,
        last_doc: cur_doc,
        last_col: cur_col,
        last_good: segments.len() as isize - 1,
    })
}

/// The path rendered inside JSON responses: everything after `/v1/<db>`.
/// Validates the prefix explicitly instead of slicing by offset.
pub fn entity_path(uri_path: &str) -> Result<&str> {
    let rest = uri_path
        .strip_prefix("/v1/")
        .ok_or_else(|| DbError::BadPath("invalid path, path should start with the form '/v1/...'".to_string()))?;
    let idx = rest
        .find('/')
        .ok_or_else(|| DbError::BadPath("bad path".to_string()))?;
    Ok(&rest[idx..])
}

/// Parse an `interval=[lo,hi]` query value into inclusive bounds. A missing
/// parameter means the full range; an empty right endpoint maps to
/// [`MAX_INTERVAL_KEY`].
pub fn parse_interval(raw: Option<&str>) -> Result<(String, String)> {
    let raw = match raw {
        Some(value) => value,
        None => "[,]",
    };
    let malformed = || DbError::InvalidQuery("malformed interval query parameter".to_string());

    let inner = raw
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(malformed)?;
    let mut bounds = inner.split(',');
    let low = bounds.next().ok_or_else(malformed)?;
    let high = bounds.next().ok_or_else(malformed)?;
    if bounds.next().is_some() {
        return Err(malformed());
    }

    let high = if high.is_empty() {
        MAX_INTERVAL_KEY.to_string()
    } else {
        high.to_string()
    };
    Ok((low.to_string(), high))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_segments_requires_v1_prefix() {
        assert!(parse_segments("/v2/db").is_err());
        assert!(parse_segments("db").is_err());
        assert!(parse_segments("/v1").is_err());
        assert_eq!(parse_segments("/v1/db").expect("parses"), vec!["db"]);
        assert_eq!(
            parse_segments("/v1/db/doc/col/").expect("parses"),
            vec!["db", "doc", "col", ""]
        );
    }

    #[test]
    fn resolver_rejects_odd_paths_and_inner_blanks() {
        let databases: SkipList<Arc<Collection>> = SkipList::new("databases");
        let segments: Vec<String> = vec!["db".into(), "doc".into(), "col".into()];
        assert!(resolve_deepest(&databases, &segments).is_err());

        let segments: Vec<String> = vec!["db".into(), "".into(), "col".into(), "".into()];
        assert!(resolve_deepest(&databases, &segments).is_err());
    }

    #[test]
    fn resolver_reports_deepest_prefix() {
        let databases: SkipList<Arc<Collection>> = SkipList::new("databases");
        databases
            .upsert::<std::convert::Infallible, _>("db", |_, _, _| {
                Ok(Arc::new(Collection::new("db")))
            })
            .expect("create db");

        let segments: Vec<String> = vec!["db".into(), "doc".into()];
        let resolved = resolve_deepest(&databases, &segments).expect("resolves");
        assert!(resolved.ends_on_collection);
        assert_eq!(resolved.last_good, 0);
        assert!(resolved.last_col.is_some());
        assert!(resolved.last_doc.is_none());

        let segments: Vec<String> = vec!["missing".into()];
        let resolved = resolve_deepest(&databases, &segments).expect("resolves");
        assert!(!resolved.ends_on_collection);
        assert_eq!(resolved.last_good, -1);
    }

    #[test]
    fn entity_path_strips_prefix_and_database() {
        assert_eq!(entity_path("/v1/db/doc").expect("strips"), "/doc");
        assert_eq!(entity_path("/v1/db/doc/col/").expect("strips"), "/doc/col/");
        assert!(entity_path("/other/db/doc").is_err());
        assert!(entity_path("/v1/db").is_err());
    }

    #[test]
    fn interval_parsing() {
        assert_eq!(
            parse_interval(None).expect("defaults"),
            (String::new(), MAX_INTERVAL_KEY.to_string())
        );
        assert_eq!(
            parse_interval(Some("[a,b]")).expect("parses"),
            ("a".to_string(), "b".to_string())
        );
        assert_eq!(
            parse_interval(Some("[d,]")).expect("parses"),
            ("d".to_string(), MAX_INTERVAL_KEY.to_string())
        );
        assert!(parse_interval(Some("a,b")).is_err());
        assert!(parse_interval(Some("[a,b,c]")).is_err());
        assert!(parse_interval(Some("[ab]")).is_err());
    }
}
