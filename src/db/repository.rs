use rusqlite::{params, params_from_iter, Row, ToSql};
use tokio::sync::RwLock;
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{Article, NewArticle, NewTag, Tag, TagCandidate, TagCriteria};

use super::query::{self, repeat_group, ARTICLE_COLUMNS, TAG_COLUMNS};
use super::reconcile::{self, tag_from_row, MAX_BATCH_ROWS};
use super::schema::SCHEMA;

/// Article and tag storage behind a single read/write guard.
///
/// Read-only lookups share the guard; every mutation holds it exclusively for
/// its whole duration. Once [`Repository::close`] has run the handle is gone and
/// every call returns [`AppError::Closed`].
pub struct Repository {
    conn: RwLock<Option<Connection>>,
}

impl Repository {
    /// Opens the database at `db_path` and makes sure the schema exists.
    pub async fn new(db_path: &str) -> Result<Self> {
        let repo = Self::open(db_path).await?;
        repo.init().await?;
        Ok(repo)
    }

    pub async fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        tracing::debug!("Opened database at {}", db_path);
        Ok(Self::from_connection(conn))
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: RwLock::new(Some(conn)),
        }
    }

    /// Runs `f` on the connection while holding the guard in shared mode.
    async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> tokio_rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let guard = self.conn.read().await;
        let conn = guard.as_ref().ok_or(AppError::Closed)?;
        Ok(conn.call(f).await?)
    }

    /// Runs `f` on the connection while holding the guard exclusively.
    async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> tokio_rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let guard = self.conn.write().await;
        let conn = guard.as_ref().ok_or(AppError::Closed)?;
        Ok(conn.call(f).await?)
    }

    // Lifecycle

    /// Creates the tables and index if they do not exist yet.
    pub async fn init(&self) -> Result<()> {
        self.write(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        tracing::debug!("Schema ready");
        Ok(())
    }

    /// Waits for every in-flight operation, then releases the connection.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.conn.write().await;
        if let Some(conn) = guard.take() {
            conn.close().await?;
            tracing::debug!("Database closed");
        }
        Ok(())
    }

    // Article operations

    pub async fn get_articles(&self) -> Result<Vec<Article>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ARTICLE_COLUMNS} FROM article ORDER BY article.id"
            ))?;
            let articles = stmt
                .query_map([], article_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(articles)
        })
        .await
    }

    /// Inserts an article and returns its generated id. A URL that is
    /// already stored fails with [`AppError::Constraint`].
    pub async fn add_article(&self, article: NewArticle) -> Result<i64> {
        if article.url.trim().is_empty() {
            return Err(AppError::InvalidInput("article url is empty".to_string()));
        }
        if article.platform.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "article platform is empty".to_string(),
            ));
        }

        let url = article.url.clone();
        let id = self
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO article (url, platform, description, thumbnail_url) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        article.url,
                        article.platform,
                        article.description,
                        article.thumbnail_url
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        tracing::debug!("Added article {} ({})", id, url);
        Ok(id)
    }

    pub async fn get_articles_by_tags(&self, tags: Vec<NewTag>) -> Result<Vec<Article>> {
        self.find_articles_by_tags(TagCriteria::Pairs(tags)).await
    }

    pub async fn get_articles_by_tag_name(&self, names: Vec<String>) -> Result<Vec<Article>> {
        self.find_articles_by_tags(TagCriteria::Names(names)).await
    }

    pub async fn get_articles_by_tag_id(&self, ids: Vec<i64>) -> Result<Vec<Article>> {
        self.find_articles_by_tags(TagCriteria::Ids(ids)).await
    }

    /// Articles associated with every tag in `criteria`. Articles carrying
    /// additional tags still match.
    pub async fn find_articles_by_tags(&self, criteria: TagCriteria) -> Result<Vec<Article>> {
        let built = query::articles_with_all_tags(&criteria)?;
        self.read(move |conn| {
            let mut stmt = conn.prepare(&built.sql)?;
            let articles = stmt
                .query_map(params_from_iter(built.params.iter()), article_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(articles)
        })
        .await
    }

    // Tag operations

    pub async fn get_tag_list(&self) -> Result<Vec<Tag>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {TAG_COLUMNS} FROM tag ORDER BY tag.id"))?;
            let tags = stmt
                .query_map([], tag_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tags)
        })
        .await
    }

    /// Inserts every tag not already stored. Returns how many were new.
    pub async fn add_tags(&self, tags: Vec<NewTag>) -> Result<usize> {
        if tags.is_empty() {
            return Ok(0);
        }
        check_tag_names(tags.iter())?;

        let inserted = self
            .write(move |conn| {
                let tx = conn.transaction()?;
                let inserted = reconcile::insert_tags(&tx, &tags)?;
                tx.commit()?;
                Ok(inserted)
            })
            .await?;
        tracing::debug!("Inserted {} new tags", inserted);
        Ok(inserted)
    }

    /// Tags whose name contains `fragment` literally; `%` and `_` in the
    /// fragment are not wildcards.
    pub async fn get_tags_containing(&self, fragment: &str) -> Result<Vec<Tag>> {
        let pattern = format!("%{}%", escape_like(fragment));
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TAG_COLUMNS} FROM tag WHERE tag.name LIKE ?1 ESCAPE '\\' ORDER BY tag.id"
            ))?;
            let tags = stmt
                .query_map(params![pattern], tag_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tags)
        })
        .await
    }

    /// Ensures every candidate exists and returns them with ids, in input
    /// order. Insert and lookup share one transaction.
    pub async fn reconcile_tags(&self, candidates: Vec<TagCandidate>) -> Result<Vec<Tag>> {
        if let Some(tags) = reconcile::all_resolved(&candidates) {
            return Ok(tags);
        }
        check_tag_names(unresolved(&candidates))?;

        self.write(move |conn| {
            let tx = conn.transaction()?;
            let tags = reconcile::reconcile(&tx, candidates)?;
            tx.commit()?;
            Ok(tags)
        })
        .await
    }

    // Association operations

    pub async fn get_tags_of_article(&self, article_id: i64) -> Result<Vec<Tag>> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TAG_COLUMNS} FROM article_tag \
                 JOIN tag ON article_tag.tag_id = tag.id \
                 WHERE article_tag.article_id = ?1 ORDER BY tag.id"
            ))?;
            let tags = stmt
                .query_map(params![article_id], tag_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tags)
        })
        .await
    }

    /// Reconciles `tags` and links each one to the article. Links that
    /// already exist are left alone. Returns the resolved tags.
    pub async fn attach_tags_to_article(
        &self,
        article_id: i64,
        tags: Vec<TagCandidate>,
    ) -> Result<Vec<Tag>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        check_tag_names(unresolved(&tags))?;

        let resolved = self
            .write(move |conn| {
                let tx = conn.transaction()?;
                let resolved = reconcile::reconcile(&tx, tags)?;
                for chunk in resolved.chunks(MAX_BATCH_ROWS) {
                    let sql = format!(
                        "INSERT OR IGNORE INTO article_tag (article_id, tag_id) VALUES {}",
                        repeat_group("(?,?)", chunk.len())
                    );
                    let mut values: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() * 2);
                    for tag in chunk {
                        values.push(&article_id);
                        values.push(&tag.id);
                    }
                    tx.execute(&sql, params_from_iter(values))?;
                }
                tx.commit()?;
                Ok(resolved)
            })
            .await?;
        tracing::debug!("Attached {} tags to article {}", resolved.len(), article_id);
        Ok(resolved)
    }
}

fn unresolved(candidates: &[TagCandidate]) -> impl Iterator<Item = &NewTag> {
    candidates.iter().filter_map(|candidate| match candidate {
        TagCandidate::Unresolved(tag) => Some(tag),
        TagCandidate::Resolved(_) => None,
    })
}

fn check_tag_names<'a>(tags: impl Iterator<Item = &'a NewTag>) -> Result<()> {
    for tag in tags {
        if tag.name.trim().is_empty() {
            return Err(AppError::InvalidInput(format!(
                "tag name is empty (type {})",
                tag.kind
            )));
        }
    }
    Ok(())
}

fn escape_like(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn article_from_row(row: &Row) -> rusqlite::Result<Article> {
    Ok(Article {
        id: row.get(0)?,
        url: row.get(1)?,
        platform: row.get(2)?,
        description: row.get(3)?,
        thumbnail_url: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    async fn repo() -> Repository {
        let repo = Repository::open_in_memory().await.unwrap();
        repo.init().await.unwrap();
        repo
    }

    fn pair(name: &str, kind: i64) -> TagCandidate {
        NewTag::new(name, kind).into()
    }

    fn ids(articles: &[Article]) -> Vec<i64> {
        articles.iter().map(|a| a.id).collect()
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let repo = repo().await;
        assert_ok!(repo.init().await);
        assert_ok!(repo.init().await);
    }

    #[tokio::test]
    async fn duplicate_url_is_rejected() {
        let repo = repo().await;
        let first = repo
            .add_article(NewArticle::new("https://a.example", "web"))
            .await
            .unwrap();

        let err = repo
            .add_article(NewArticle::new("https://a.example", "mobile"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Constraint(_)), "got {err:?}");

        let second = repo
            .add_article(NewArticle::new("https://b.example", "web"))
            .await
            .unwrap();
        assert!(second > first);

        let articles = repo.get_articles().await.unwrap();
        assert_eq!(ids(&articles), vec![first, second]);
        assert_eq!(articles[0].platform, "web");
    }

    #[tokio::test]
    async fn empty_url_fails_before_storage() {
        let repo = repo().await;
        let err = repo.add_article(NewArticle::new(" ", "web")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert!(repo.get_articles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn optional_fields_round_trip_through_storage() {
        let repo = repo().await;
        repo.add_article(NewArticle::new("https://a.example", "web").with_description(""))
            .await
            .unwrap();
        repo.add_article(
            NewArticle::new("https://b.example", "web").with_thumbnail("https://b.example/t.png"),
        )
        .await
        .unwrap();

        let articles = repo.get_articles().await.unwrap();
        assert_eq!(articles[0].description.as_deref(), Some(""));
        assert_eq!(articles[0].thumbnail_url, None);
        assert_eq!(articles[1].description, None);
        assert_eq!(
            articles[1].thumbnail_url.as_deref(),
            Some("https://b.example/t.png")
        );
    }

    #[tokio::test]
    async fn go_rust_scenario() {
        let repo = repo().await;
        assert_eq!(
            repo.add_tags(vec![NewTag::new("go", 0), NewTag::new("rust", 0)])
                .await
                .unwrap(),
            2
        );
        let one = repo
            .add_article(NewArticle::new("https://one.example", "web"))
            .await
            .unwrap();
        let two = repo
            .add_article(NewArticle::new("https://two.example", "web"))
            .await
            .unwrap();

        repo.attach_tags_to_article(one, vec![pair("go", 0), pair("rust", 0)])
            .await
            .unwrap();
        repo.attach_tags_to_article(two, vec![pair("go", 0)])
            .await
            .unwrap();

        let both = repo
            .get_articles_by_tags(vec![NewTag::new("go", 0), NewTag::new("rust", 0)])
            .await
            .unwrap();
        assert_eq!(ids(&both), vec![one]);

        let go = repo
            .get_articles_by_tags(vec![NewTag::new("go", 0)])
            .await
            .unwrap();
        assert_eq!(ids(&go), vec![one, two]);
    }

    #[tokio::test]
    async fn superset_matches_and_missing_tag_excludes() {
        let repo = repo().await;
        let id = repo
            .add_article(NewArticle::new("https://a.example", "web"))
            .await
            .unwrap();
        let tags = repo
            .attach_tags_to_article(id, vec![pair("a", 0), pair("b", 0), pair("c", 0)])
            .await
            .unwrap();
        repo.add_tags(vec![NewTag::new("never", 0)]).await.unwrap();

        let by_name = repo
            .get_articles_by_tag_name(vec!["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(ids(&by_name), vec![id]);

        let by_id = repo
            .get_articles_by_tag_id(vec![tags[0].id, tags[2].id])
            .await
            .unwrap();
        assert_eq!(ids(&by_id), vec![id]);

        let missing = repo
            .get_articles_by_tag_name(vec!["a".into(), "never".into()])
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn name_under_two_types_does_not_satisfy_two_names() {
        let repo = repo().await;
        let id = repo
            .add_article(NewArticle::new("https://a.example", "web"))
            .await
            .unwrap();
        repo.attach_tags_to_article(id, vec![pair("go", 0), pair("go", 1)])
            .await
            .unwrap();

        let found = repo
            .get_articles_by_tag_name(vec!["go".into(), "rust".into()])
            .await
            .unwrap();
        assert!(found.is_empty());

        let found = repo
            .get_articles_by_tag_name(vec!["go".into()])
            .await
            .unwrap();
        assert_eq!(ids(&found), vec![id]);
    }

    #[tokio::test]
    async fn empty_criteria_is_an_input_error() {
        let repo = repo().await;
        let err = repo.get_articles_by_tag_id(vec![]).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn reattaching_is_a_no_op() {
        let repo = repo().await;
        let id = repo
            .add_article(NewArticle::new("https://a.example", "web"))
            .await
            .unwrap();

        let first = repo
            .attach_tags_to_article(id, vec![pair("go", 0)])
            .await
            .unwrap();
        let again = repo
            .attach_tags_to_article(id, vec![first[0].clone().into(), pair("rust", 0)])
            .await
            .unwrap();
        assert_eq!(again[0], first[0]);

        let tags = repo.get_tags_of_article(id).await.unwrap();
        let names: Vec<_> = tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["go", "rust"]);
    }

    #[tokio::test]
    async fn reconcile_twice_returns_same_ids() {
        let repo = repo().await;
        let input = vec![pair("x", 0), pair("y", 2)];
        let first = repo.reconcile_tags(input.clone()).await.unwrap();
        let second = repo.reconcile_tags(input).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(repo.get_tag_list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn contains_search_treats_wildcards_literally() {
        let repo = repo().await;
        repo.add_tags(vec![
            NewTag::new("rust", 0),
            NewTag::new("trust", 1),
            NewTag::new("100%", 0),
            NewTag::new("snake_case", 0),
            NewTag::new("snakeXcase", 0),
        ])
        .await
        .unwrap();

        let names = |tags: Vec<Tag>| tags.into_iter().map(|t| t.name).collect::<Vec<_>>();

        assert_eq!(
            names(repo.get_tags_containing("rust").await.unwrap()),
            vec!["rust", "trust"]
        );
        assert_eq!(
            names(repo.get_tags_containing("%").await.unwrap()),
            vec!["100%"]
        );
        assert_eq!(
            names(repo.get_tags_containing("_").await.unwrap()),
            vec!["snake_case"]
        );
        assert!(repo
            .get_tags_containing("' OR '1'='1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn calls_after_close_fail() {
        let repo = repo().await;
        assert_ok!(repo.close().await);
        assert_ok!(repo.close().await);
        assert!(matches!(
            repo.get_articles().await,
            Err(AppError::Closed)
        ));
        assert_err!(repo.add_tags(vec![NewTag::new("late", 0)]).await);
    }

    #[tokio::test]
    async fn blank_tag_names_fail_before_storage() {
        let repo = repo().await;
        let id = repo
            .add_article(NewArticle::new("https://a.example", "web"))
            .await
            .unwrap();

        let err = repo
            .add_tags(vec![NewTag::new("ok", 0), NewTag::new("   ", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)), "got {err:?}");

        let err = repo
            .attach_tags_to_article(id, vec![pair("go", 0), pair("", 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)), "got {err:?}");

        let err = repo
            .reconcile_tags(vec![pair("\t", 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)), "got {err:?}");

        assert!(repo.get_tag_list().await.unwrap().is_empty());
        assert!(repo.get_tags_of_article(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_reconcile_rolls_back_attach() {
        let repo = Repository::open_in_memory().await.unwrap();
        // A tag table missing UNIQUE(name, type) lets one key match two rows.
        repo.write(|conn| {
            conn.execute_batch(
                "CREATE TABLE article (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     url TEXT UNIQUE NOT NULL,
                     platform TEXT NOT NULL,
                     description TEXT,
                     thumbnail_url TEXT
                 );
                 CREATE TABLE tag (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     name TEXT NOT NULL,
                     type INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE TABLE article_tag (
                     article_id INTEGER NOT NULL,
                     tag_id INTEGER NOT NULL,
                     UNIQUE(article_id, tag_id)
                 );
                 INSERT INTO tag (name, type) VALUES ('go', 0), ('go', 0);",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let id = repo
            .add_article(NewArticle::new("https://a.example", "web"))
            .await
            .unwrap();

        let err = repo
            .attach_tags_to_article(id, vec![pair("go", 0), pair("rust", 0)])
            .await
            .unwrap_err();
        assert!(err.is_fatal(), "got {err:?}");
        assert!(
            matches!(err, AppError::Inconsistent { expected: 2, found } if found > 2),
            "got {err:?}"
        );

        assert!(repo.get_tags_of_article(id).await.unwrap().is_empty());
        let links: i64 = repo
            .read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM article_tag", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(links, 0);

        let names: Vec<_> = repo
            .get_tag_list()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["go", "go"]);
    }

    #[test]
    fn escape_like_escapes_wildcards() {
        assert_eq!(escape_like(r"a%b_c\d"), r"a\%b\_c\\d");
        assert_eq!(escape_like("plain"), "plain");
    }
}
