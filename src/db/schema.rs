pub const SCHEMA: &str = r#"
-- article table
CREATE TABLE IF NOT EXISTS article (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT UNIQUE NOT NULL,
    platform TEXT NOT NULL,
    description TEXT,
    thumbnail_url TEXT
);

-- tag table
CREATE TABLE IF NOT EXISTS tag (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    type INTEGER NOT NULL DEFAULT 0,
    UNIQUE(name, type)
);

-- article_tag table
CREATE TABLE IF NOT EXISTS article_tag (
    article_id INTEGER NOT NULL,
    tag_id INTEGER NOT NULL,
    UNIQUE(article_id, tag_id)
);

CREATE INDEX IF NOT EXISTS tag_name_index ON tag(name);
"#;
