//! SQLite-backed blog post store.
//!
//! Posts belong to an identity; ownership checks happen at the handler
//! level, this store only answers who owns what. Search is a LIKE scan
//! over title/content/author with an optional field filter.

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A published blog post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub content: String,
    pub author_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a post.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub user_id: String,
    pub title: String,
    pub content: String,
    pub author_name: String,
}

/// Partial post update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct PostUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub author_name: Option<String>,
}

/// Which column(s) a search query matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFilter {
    All,
    Title,
    Content,
    Author,
}

impl SearchFilter {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "title" => Self::Title,
            "content" => Self::Content,
            "author" => Self::Author,
            _ => Self::All,
        }
    }
}

/// SQLite-backed post store.
pub struct BlogStore {
    conn: Mutex<rusqlite::Connection>,
}

impl BlogStore {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;

             CREATE TABLE IF NOT EXISTS posts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                author_name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_posts_user ON posts(user_id);
             CREATE INDEX IF NOT EXISTS idx_posts_created ON posts(created_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create(&self, new: &NewPost) -> Result<Post, ApiError> {
        let title = new.title.trim();
        let author = new.author_name.trim();
        if title.is_empty() || title.len() > 255 {
            return Err(ApiError::validation(
                "title",
                "Title is required (max 255 characters)",
            ));
        }
        if new.content.trim().is_empty() {
            return Err(ApiError::validation("content", "Content is required"));
        }
        if author.is_empty() || author.len() > 255 {
            return Err(ApiError::validation(
                "author_name",
                "Author name is required (max 255 characters)",
            ));
        }

        let post = Post {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: new.user_id.clone(),
            title: title.to_string(),
            content: new.content.clone(),
            author_name: author.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO posts (id, user_id, title, content, author_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                post.id,
                post.user_id,
                post.title,
                post.content,
                post.author_name,
                post.created_at.to_rfc3339(),
                post.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| ApiError::Internal(e.into()))?;

        Ok(post)
    }

    /// All posts, newest first.
    pub fn list_latest(&self) -> Result<Vec<Post>, ApiError> {
        self.query_posts("SELECT * FROM posts ORDER BY created_at DESC", &[])
    }

    pub fn get(&self, id: &str) -> Result<Option<Post>, ApiError> {
        let posts = self.query_posts("SELECT * FROM posts WHERE id = ?1", &[&id])?;
        Ok(posts.into_iter().next())
    }

    /// Posts by one author, newest first.
    pub fn list_by_user(&self, user_id: &str) -> Result<Vec<Post>, ApiError> {
        self.query_posts(
            "SELECT * FROM posts WHERE user_id = ?1 ORDER BY created_at DESC",
            &[&user_id],
        )
    }

    /// Case-insensitive substring search over the filtered column(s).
    pub fn search(&self, query: &str, filter: SearchFilter) -> Result<Vec<Post>, ApiError> {
        let pattern = format!("%{}%", escape_like(query));
        let sql = match filter {
            SearchFilter::Title => {
                "SELECT * FROM posts WHERE title LIKE ?1 ESCAPE '\\' ORDER BY created_at DESC"
            }
            SearchFilter::Content => {
                "SELECT * FROM posts WHERE content LIKE ?1 ESCAPE '\\' ORDER BY created_at DESC"
            }
            SearchFilter::Author => {
                "SELECT * FROM posts WHERE author_name LIKE ?1 ESCAPE '\\' ORDER BY created_at DESC"
            }
            SearchFilter::All => {
                "SELECT * FROM posts WHERE title LIKE ?1 ESCAPE '\\'
                    OR content LIKE ?1 ESCAPE '\\'
                    OR author_name LIKE ?1 ESCAPE '\\'
                 ORDER BY created_at DESC"
            }
        };
        self.query_posts(sql, &[&pattern])
    }

    pub fn update(&self, id: &str, update: &PostUpdate) -> Result<Post, ApiError> {
        let existing = self.get(id)?.ok_or(ApiError::NotFound("post"))?;

        let title = update.title.as_deref().unwrap_or(&existing.title).trim();
        let content = update.content.as_deref().unwrap_or(&existing.content);
        let author = update
            .author_name
            .as_deref()
            .unwrap_or(&existing.author_name)
            .trim();
        if title.is_empty() || content.trim().is_empty() || author.is_empty() {
            return Err(ApiError::validation(
                "title",
                "Title, content and author name cannot be empty",
            ));
        }

        let updated_at = Utc::now();
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE posts SET title = ?1, content = ?2, author_name = ?3, updated_at = ?4
             WHERE id = ?5",
            rusqlite::params![title, content, author, updated_at.to_rfc3339(), id],
        )
        .map_err(|e| ApiError::Internal(e.into()))?;
        drop(conn);

        self.get(id)?.ok_or(ApiError::NotFound("post"))
    }

    pub fn delete(&self, id: &str) -> Result<bool, ApiError> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute("DELETE FROM posts WHERE id = ?1", rusqlite::params![id])
            .map_err(|e| ApiError::Internal(e.into()))?;
        Ok(deleted > 0)
    }

    fn query_posts(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Post>, ApiError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(|e| ApiError::Internal(e.into()))?;
        let posts = stmt
            .query_map(params, post_from_row)
            .map_err(|e| ApiError::Internal(e.into()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ApiError::Internal(e.into()))?;
        Ok(posts)
    }
}

fn post_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Post> {
    let created_raw: String = row.get(5)?;
    let updated_raw: String = row.get(6)?;
    Ok(Post {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        author_name: row.get(4)?,
        created_at: parse_ts(&created_raw),
        updated_at: parse_ts(&updated_raw),
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Escape LIKE metacharacters so user input matches literally.
fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
