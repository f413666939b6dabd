use crate::paths::AppPaths;
use crate::{db, now_ms, Result};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    Download,
    FetchInfo,
    FetchLinks,
}

impl HistoryOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryOperation::Download => "download",
            HistoryOperation::FetchInfo => "fetch_info",
            HistoryOperation::FetchLinks => "fetch_links",
        }
    }

    fn from_str(value: &str) -> Self {
        match value {
            "fetch_info" => HistoryOperation::FetchInfo,
            "fetch_links" => HistoryOperation::FetchLinks,
            _ => HistoryOperation::Download,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub format: Option<String>,
    pub dest_path: Option<String>,
    pub operation: HistoryOperation,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub url: String,
    pub title: Option<String>,
    pub format: Option<String>,
    pub dest_path: Option<String>,
    pub operation: HistoryOperation,
}

/// Durable record of finished operations. Each call opens its own connection.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    paths: AppPaths,
}

impl HistoryStore {
    pub fn open(paths: AppPaths) -> Result<Self> {
        db::ensure_schema(&paths)?;
        Ok(Self { paths })
    }

    pub fn insert(&self, entry: NewHistoryEntry) -> Result<HistoryEntry> {
        let conn = db::open(&self.paths)?;
        db::migrate(&conn)?;

        let created_at_ms = now_ms();
        conn.execute(
            r#"
INSERT INTO history (url, title, format, dest_path, operation, created_at_ms)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
            params![
                &entry.url,
                &entry.title,
                &entry.format,
                &entry.dest_path,
                entry.operation.as_str(),
                created_at_ms
            ],
        )?;

        Ok(HistoryEntry {
            id: conn.last_insert_rowid(),
            url: entry.url,
            title: entry.title,
            format: entry.format,
            dest_path: entry.dest_path,
            operation: entry.operation,
            created_at_ms,
        })
    }

    /// Lazy most-recent-first walk over all entries.
    pub fn list_all(&self) -> HistoryCursor {
        HistoryCursor::new(self.paths.clone(), DEFAULT_PAGE_SIZE)
    }

    pub fn list(&self, limit: usize, offset: usize) -> Result<Vec<HistoryEntry>> {
        let conn = db::open(&self.paths)?;
        db::migrate(&conn)?;

        let mut stmt = conn.prepare(
            r#"
SELECT id, url, title, format, dest_path, operation, created_at_ms
FROM history
ORDER BY created_at_ms DESC, id DESC
LIMIT ?1 OFFSET ?2
"#,
        )?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = db::open(&self.paths)?;
        db::migrate(&conn)?;
        let removed = conn.execute("DELETE FROM history WHERE id=?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn clear_all(&self) -> Result<usize> {
        let conn = db::open(&self.paths)?;
        db::migrate(&conn)?;
        let removed = conn.execute("DELETE FROM history", [])?;
        Ok(removed)
    }
}

/// Pages through history with keyset pagination, so rows inserted or deleted
/// mid-walk never cause skips or repeats among the remaining older rows.
#[derive(Debug)]
pub struct HistoryCursor {
    paths: AppPaths,
    page_size: usize,
    last_key: Option<(i64, i64)>,
    buffer: VecDeque<HistoryEntry>,
    exhausted: bool,
}

impl HistoryCursor {
    fn new(paths: AppPaths, page_size: usize) -> Self {
        Self {
            paths,
            page_size: page_size.max(1),
            last_key: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Starts again from the newest entry.
    pub fn rewind(&mut self) {
        self.last_key = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fetch_page(&mut self) -> Result<()> {
        let conn = db::open(&self.paths)?;
        db::migrate(&conn)?;

        let page = match self.last_key {
            None => {
                let mut stmt = conn.prepare(
                    r#"
SELECT id, url, title, format, dest_path, operation, created_at_ms
FROM history
ORDER BY created_at_ms DESC, id DESC
LIMIT ?1
"#,
                )?;
                let rows = stmt
                    .query_map(params![self.page_size as i64], entry_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            Some((created_at_ms, id)) => {
                let mut stmt = conn.prepare(
                    r#"
SELECT id, url, title, format, dest_path, operation, created_at_ms
FROM history
WHERE created_at_ms < ?1 OR (created_at_ms = ?1 AND id < ?2)
ORDER BY created_at_ms DESC, id DESC
LIMIT ?3
"#,
                )?;
                let rows = stmt
                    .query_map(
                        params![created_at_ms, id, self.page_size as i64],
                        entry_from_row,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.last_key = Some((last.created_at_ms, last.id));
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for HistoryCursor {
    type Item = Result<HistoryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let operation: String = row.get(5)?;
    Ok(HistoryEntry {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        format: row.get(3)?,
        dest_path: row.get(4)?,
        operation: HistoryOperation::from_str(&operation),
        created_at_ms: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download_entry(url: &str) -> NewHistoryEntry {
        NewHistoryEntry {
            url: url.to_string(),
            title: Some(format!("title of {url}")),
            format: Some("720p".to_string()),
            dest_path: Some("/downloads/video.mp4".to_string()),
            operation: HistoryOperation::Download,
        }
    }

    fn collect(store: &HistoryStore) -> Vec<HistoryEntry> {
        store
            .list_all()
            .collect::<Result<Vec<_>>>()
            .expect("list all")
    }

    #[test]
    fn insert_then_delete_removes_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open(AppPaths::new(dir.path().to_path_buf())).expect("open");

        let kept = store.insert(download_entry("https://example.com/a")).expect("insert a");
        let gone = store.insert(download_entry("https://example.com/b")).expect("insert b");

        assert!(store.delete(gone.id).expect("delete"));
        assert!(!store.delete(gone.id).expect("delete twice"));

        let all = collect(&store);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], kept);
    }

    #[test]
    fn clear_all_empties_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open(AppPaths::new(dir.path().to_path_buf())).expect("open");
        for i in 0..3 {
            store
                .insert(download_entry(&format!("https://example.com/{i}")))
                .expect("insert");
        }
        assert_eq!(store.clear_all().expect("clear"), 3);
        assert!(collect(&store).is_empty());
    }

    #[test]
    fn list_all_is_most_recent_first_across_pages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open(AppPaths::new(dir.path().to_path_buf())).expect("open");
        let mut inserted = Vec::new();
        for i in 0..7 {
            inserted.push(
                store
                    .insert(download_entry(&format!("https://example.com/{i}")))
                    .expect("insert"),
            );
        }

        let walked: Vec<i64> = store
            .list_all()
            .with_page_size(3)
            .map(|entry| entry.expect("entry").id)
            .collect();
        let expected: Vec<i64> = inserted.iter().rev().map(|e| e.id).collect();
        assert_eq!(walked, expected);
    }

    #[test]
    fn cursor_rewind_restarts_from_newest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open(AppPaths::new(dir.path().to_path_buf())).expect("open");
        store.insert(download_entry("https://example.com/old")).expect("old");
        let newest = store.insert(download_entry("https://example.com/new")).expect("new");

        let mut cursor = store.list_all().with_page_size(1);
        let first = cursor.next().expect("some").expect("ok");
        assert_eq!(first.id, newest.id);
        let _ = cursor.by_ref().count();
        assert!(cursor.next().is_none());

        cursor.rewind();
        let again = cursor.next().expect("some").expect("ok");
        assert_eq!(again.id, newest.id);
    }

    #[test]
    fn operation_round_trips_through_storage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open(AppPaths::new(dir.path().to_path_buf())).expect("open");
        store
            .insert(NewHistoryEntry {
                url: "https://example.com/list".to_string(),
                title: None,
                format: None,
                dest_path: None,
                operation: HistoryOperation::FetchLinks,
            })
            .expect("insert");
        let listed = store.list(10, 0).expect("list");
        assert_eq!(listed[0].operation, HistoryOperation::FetchLinks);
        assert!(listed[0].title.is_none());
    }
}
