use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params};
use serde::de::DeserializeOwned;
use tracing::debug;
use twig_core::{ConversationSnapshot, ConversationSummary};

use crate::database::Database;
use crate::error::{Error, Result};

const SUMMARY_COLUMNS: &str = "id, title, model, project_id, has_error, created_at_ms, updated_at_ms";

/// Filter for [`Conversations::list`].
#[derive(Debug, Clone, Default)]
pub struct ListConversations {
    pub project_id: Option<String>,
    pub limit: Option<usize>,
}

pub struct Conversations<'db> {
    pub(crate) db: &'db mut Database,
}

impl Conversations<'_> {
    /// Insert or replace the stored snapshot with the same id.
    pub fn save(&mut self, snapshot: &ConversationSnapshot) -> Result<()> {
        if snapshot.id.trim().is_empty() {
            return Err(Error::InvalidSnapshot("conversation id is empty".into()));
        }
        let tree_json = serde_json::to_string(&snapshot.tree)?;
        let path_text = snapshot.tree.path_text();

        let tx = self.db.conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations (
                id, title, model, project_id, tree_json, path_text, has_error,
                created_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                model = excluded.model,
                project_id = excluded.project_id,
                tree_json = excluded.tree_json,
                path_text = excluded.path_text,
                has_error = excluded.has_error,
                updated_at_ms = excluded.updated_at_ms",
            params![
                snapshot.id,
                snapshot.title,
                snapshot.model,
                snapshot.project_id,
                tree_json,
                path_text,
                snapshot.has_error,
                snapshot.created_at_ms,
                snapshot.updated_at_ms,
            ],
        )?;
        tx.commit()?;

        debug!(
            conversation_id = %snapshot.id,
            branches = snapshot.tree.branch_count(),
            "saved conversation"
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<ConversationSnapshot>> {
        self.db
            .conn
            .query_row(
                "SELECT id, title, model, project_id, has_error, created_at_ms, updated_at_ms, tree_json
                 FROM conversations
                 WHERE id = ?1",
                params![id],
                row_to_snapshot,
            )
            .optional()
            .map_err(Error::from)
    }

    /// Like [`get`](Self::get) but a missing conversation is an error.
    pub fn require(&self, id: &str) -> Result<ConversationSnapshot> {
        self.get(id)?
            .ok_or_else(|| Error::ConversationNotFound(id.to_string()))
    }

    /// Most recently updated first.
    pub fn list(&self, filter: &ListConversations) -> Result<Vec<ConversationSummary>> {
        let limit = filter.limit.map_or(-1, |limit| limit as i64);
        let mut stmt = self.db.conn.prepare(&format!(
            "SELECT {SUMMARY_COLUMNS}
             FROM conversations
             WHERE ?1 IS NULL OR project_id = ?1
             ORDER BY updated_at_ms DESC, id
             LIMIT ?2"
        ))?;

        let iter = stmt.query_map(params![filter.project_id, limit], row_to_summary)?;
        collect_rows(iter)
    }

    /// Conversations whose current path mentions `query`, most recent first.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<ConversationSummary>> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        let mut stmt = self.db.conn.prepare(&format!(
            "SELECT {SUMMARY_COLUMNS}
             FROM conversations
             WHERE path_text LIKE ?1 ESCAPE '\\' OR title LIKE ?1 ESCAPE '\\'
             ORDER BY updated_at_ms DESC, id
             LIMIT ?2"
        ))?;

        let iter = stmt.query_map(params![pattern, limit as i64], row_to_summary)?;
        collect_rows(iter)
    }

    pub fn delete(&mut self, id: &str) -> Result<bool> {
        let removed = self
            .db
            .conn
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }
}

fn row_to_summary(row: &Row<'_>) -> rusqlite::Result<ConversationSummary> {
    Ok(ConversationSummary {
        id: row.get(0)?,
        title: row.get(1)?,
        model: row.get(2)?,
        project_id: row.get(3)?,
        has_error: row.get(4)?,
        created_at_ms: row.get(5)?,
        updated_at_ms: row.get(6)?,
    })
}

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<ConversationSnapshot> {
    Ok(ConversationSnapshot {
        id: row.get(0)?,
        title: row.get(1)?,
        model: row.get(2)?,
        project_id: row.get(3)?,
        has_error: row.get(4)?,
        created_at_ms: row.get(5)?,
        updated_at_ms: row.get(6)?,
        tree: parse_json_column(row, 7)?,
    })
}

fn parse_json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn collect_rows<T, F>(iter: rusqlite::MappedRows<'_, F>) -> Result<Vec<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut rows = Vec::new();
    for row in iter {
        rows.push(row?);
    }
    Ok(rows)
}

fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use twig_core::{ConversationRecord, Part, Role};

    use crate::Store;

    use super::*;

    fn record(text: &str) -> ConversationRecord {
        let mut record = ConversationRecord::new("test-model");
        record
            .add_branch(Role::User, vec![Part::text(text)])
            .expect("user");
        record
            .add_branch(Role::Model, vec![Part::text("sure")])
            .expect("model");
        record
    }

    #[test]
    fn save_then_get_restores_the_tree() {
        let mut store = Store::open_in_memory().expect("store");
        let mut record = record("hello there");
        let user = record.current_path()[0].clone();
        record
            .add_version(&user, vec![Part::text("hello again")], false)
            .expect("edit");
        let snapshot = record.snapshot();

        store.conversations().save(&snapshot).expect("save");
        let loaded = store
            .conversations()
            .require(record.id())
            .expect("stored");

        assert_eq!(loaded, snapshot);
        let restored = ConversationRecord::from_snapshot(loaded);
        assert_eq!(restored.current_path(), record.current_path());
        assert_eq!(restored.title(), Some("hello there"));
    }

    #[test]
    fn save_twice_keeps_one_row_and_creation_time() {
        let mut store = Store::open_in_memory().expect("store");
        let mut record = record("first");
        let first = record.snapshot();
        store.conversations().save(&first).expect("save");

        record
            .add_branch(Role::User, vec![Part::text("second")])
            .expect("user");
        let mut second = record.snapshot();
        second.created_at_ms = first.created_at_ms + 1_000;
        store.conversations().save(&second).expect("save");

        let all = store
            .conversations()
            .list(&ListConversations::default())
            .expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].created_at_ms, first.created_at_ms);
        let loaded = store.conversations().require(record.id()).expect("stored");
        assert_eq!(loaded.tree.branch_count(), 3);
    }

    #[test]
    fn list_orders_by_update_and_filters_by_project() {
        let mut store = Store::open_in_memory().expect("store");
        let mut conversations = store.conversations();
        for (text, project, updated) in [("a", Some("p1"), 10), ("b", None, 30), ("c", Some("p1"), 20)] {
            let mut snapshot = record(text).snapshot();
            snapshot.project_id = project.map(str::to_string);
            snapshot.updated_at_ms = updated;
            conversations.save(&snapshot).expect("save");
        }

        let titles = |summaries: Vec<ConversationSummary>| -> Vec<String> {
            summaries.into_iter().filter_map(|s| s.title).collect()
        };
        let all = conversations.list(&ListConversations::default()).expect("list");
        assert_eq!(titles(all), ["b", "c", "a"]);

        let filter = ListConversations {
            project_id: Some("p1".into()),
            limit: Some(1),
        };
        assert_eq!(titles(conversations.list(&filter).expect("list")), ["c"]);
    }

    #[test]
    fn search_matches_the_current_path() {
        let mut store = Store::open_in_memory().expect("store");
        let mut conversations = store.conversations();
        conversations.save(&record("rust lifetimes").snapshot()).expect("save");
        conversations.save(&record("100% cotton").snapshot()).expect("save");

        let hits = conversations.search("lifetimes", 10).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title.as_deref(), Some("rust lifetimes"));

        let hits = conversations.search("0%", 10).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(conversations.search("sure", 10).expect("search").len(), 2);
    }

    #[test]
    fn corrupt_tree_json_is_an_error() {
        let mut store = Store::open_in_memory().expect("store");
        let snapshot = record("x").snapshot();
        store.conversations().save(&snapshot).expect("save");
        store
            .conversations()
            .db
            .conn
            .execute(
                "UPDATE conversations SET tree_json = '{\"root\":\"missing\",\"branches\":[]}'",
                [],
            )
            .expect("corrupt");

        assert!(store.conversations().get(&snapshot.id).is_err());
    }

    #[test]
    fn delete_reports_missing_rows() {
        let mut store = Store::open_in_memory().expect("store");
        let snapshot = record("x").snapshot();
        store.conversations().save(&snapshot).expect("save");

        assert!(store.conversations().delete(&snapshot.id).expect("delete"));
        assert!(!store.conversations().delete(&snapshot.id).expect("delete"));
        assert!(matches!(
            store.conversations().require(&snapshot.id),
            Err(Error::ConversationNotFound(_))
        ));
    }
}
