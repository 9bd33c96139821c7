//! Builds the AND-semantics tag-intersection lookups.
//!
//! Every lookup groups `article_tag` rows by article and keeps the groups that
//! matched at least as many tags as were requested, then joins the surviving
//! ids back to `article`. All caller text is bound, never interpolated.

use std::collections::HashSet;
use std::hash::Hash;

use rusqlite::types::Value;

use crate::error::{AppError, Result};
use crate::models::TagCriteria;

pub(crate) const ARTICLE_COLUMNS: &str =
    "article.id, article.url, article.platform, article.description, article.thumbnail_url";

pub(crate) const TAG_COLUMNS: &str = "tag.id, tag.name, tag.type";

#[derive(Debug)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// `group` repeated `count` times, comma separated: `(?,?),(?,?)`.
pub(crate) fn repeat_group(group: &str, count: usize) -> String {
    vec![group; count].join(",")
}

fn dedup<T: Eq + Hash + Clone>(items: &[T]) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .iter()
        .filter(|item| seen.insert((*item).clone()))
        .cloned()
        .collect()
}

fn wrap(matched: &str) -> String {
    format!(
        "SELECT {ARTICLE_COLUMNS} FROM article \
         INNER JOIN ({matched}) matched ON article.id = matched.id \
         ORDER BY article.id"
    )
}

pub fn articles_with_all_tags(criteria: &TagCriteria) -> Result<BuiltQuery> {
    if criteria.is_empty() {
        return Err(AppError::InvalidInput(
            "tag criteria must name at least one tag".to_string(),
        ));
    }

    let (matched, mut params, required) = match criteria {
        TagCriteria::Pairs(tags) => {
            let tags = dedup(tags);
            let matched = format!(
                "SELECT article_tag.article_id AS id FROM article_tag \
                 INNER JOIN tag ON article_tag.tag_id = tag.id \
                 WHERE (tag.name, tag.type) IN (VALUES {}) \
                 GROUP BY article_tag.article_id HAVING COUNT(*) >= ?",
                repeat_group("(?,?)", tags.len())
            );
            let params = tags
                .iter()
                .flat_map(|t| [Value::Text(t.name.clone()), Value::Integer(t.kind)])
                .collect::<Vec<_>>();
            (matched, params, tags.len())
        }
        TagCriteria::Names(names) => {
            let names = dedup(names);
            // A name may exist under several types; count each name once.
            let matched = format!(
                "SELECT article_tag.article_id AS id FROM article_tag \
                 INNER JOIN tag ON article_tag.tag_id = tag.id \
                 WHERE tag.name IN ({}) \
                 GROUP BY article_tag.article_id HAVING COUNT(DISTINCT tag.name) >= ?",
                repeat_group("?", names.len())
            );
            let params = names.iter().cloned().map(Value::Text).collect::<Vec<_>>();
            (matched, params, names.len())
        }
        TagCriteria::Ids(ids) => {
            let ids = dedup(ids);
            let matched = format!(
                "SELECT article_id AS id FROM article_tag \
                 WHERE tag_id IN ({}) \
                 GROUP BY article_id HAVING COUNT(*) >= ?",
                repeat_group("?", ids.len())
            );
            let params = ids.iter().copied().map(Value::Integer).collect::<Vec<_>>();
            (matched, params, ids.len())
        }
    };

    params.push(Value::Integer(required as i64));

    Ok(BuiltQuery {
        sql: wrap(&matched),
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTag;

    #[test]
    fn empty_criteria_is_rejected() {
        for criteria in [
            TagCriteria::Pairs(vec![]),
            TagCriteria::Names(vec![]),
            TagCriteria::Ids(vec![]),
        ] {
            assert!(matches!(
                articles_with_all_tags(&criteria),
                Err(AppError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn pair_query_binds_name_type_then_count() {
        let query = articles_with_all_tags(&TagCriteria::Pairs(vec![
            NewTag::new("go", 0),
            NewTag::new("rust", 1),
        ]))
        .unwrap();

        assert!(query.sql.contains("IN (VALUES (?,?),(?,?))"));
        assert!(query.sql.contains("HAVING COUNT(*) >= ?"));
        assert_eq!(
            query.params,
            vec![
                Value::Text("go".into()),
                Value::Integer(0),
                Value::Text("rust".into()),
                Value::Integer(1),
                Value::Integer(2),
            ]
        );
    }

    #[test]
    fn name_query_counts_distinct_names() {
        let query =
            articles_with_all_tags(&TagCriteria::Names(vec!["a".into(), "b".into()])).unwrap();
        assert!(query.sql.contains("tag.name IN (?,?)"));
        assert!(query.sql.contains("COUNT(DISTINCT tag.name)"));
        assert_eq!(query.params.last(), Some(&Value::Integer(2)));
    }

    #[test]
    fn id_query_skips_tag_join() {
        let query = articles_with_all_tags(&TagCriteria::Ids(vec![3, 9, 11])).unwrap();
        assert!(query.sql.contains("tag_id IN (?,?,?)"));
        assert!(!query.sql.contains("INNER JOIN tag"));
        assert_eq!(query.params.len(), 4);
    }

    #[test]
    fn duplicate_criteria_collapse() {
        let query = articles_with_all_tags(&TagCriteria::Ids(vec![5, 5, 6])).unwrap();
        assert_eq!(
            query.params,
            vec![Value::Integer(5), Value::Integer(6), Value::Integer(2)]
        );
    }

    #[test]
    fn caller_text_never_reaches_sql() {
        let hostile = "x') OR 1=1; --".to_string();
        let query = articles_with_all_tags(&TagCriteria::Names(vec![hostile.clone()])).unwrap();
        assert!(!query.sql.contains(&hostile));
        assert_eq!(query.params[0], Value::Text(hostile));
    }

    #[test]
    fn repeat_group_joins_with_commas() {
        assert_eq!(repeat_group("?", 1), "?");
        assert_eq!(repeat_group("(?,?)", 3), "(?,?),(?,?),(?,?)");
    }
}
