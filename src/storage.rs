use crate::api::models::Peer;
use crate::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const SELECTED_PEER_KEY: &str = "selected_peer";

pub struct Storage {
    conn: Connection,
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                contact_info TEXT NOT NULL,
                position INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    pub fn replace_peers(&mut self, peers: &[Peer]) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM peers", [])?;
        for (idx, p) in peers.iter().enumerate() {
            tx.execute(
                r#"
                INSERT INTO peers (id, display_name, contact_info, position, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    display_name=excluded.display_name,
                    contact_info=excluded.contact_info,
                    position=excluded.position,
                    updated_at=excluded.updated_at
                "#,
                params![p.id, p.display_name, p.contact_info, idx as i64, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn cached_peers(&self) -> Result<Vec<Peer>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, display_name, contact_info FROM peers ORDER BY position ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Peer {
                id: row.get(0)?,
                display_name: row.get(1)?,
                contact_info: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn selected_peer(&self) -> Result<Option<String>> {
        let id = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![SELECTED_PEER_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn set_selected_peer(&self, peer_id: Option<&str>) -> Result<()> {
        match peer_id {
            Some(id) => self.conn.execute(
                r#"
                INSERT INTO settings (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value=excluded.value
                "#,
                params![SELECTED_PEER_KEY, id],
            )?,
            None => self
                .conn
                .execute("DELETE FROM settings WHERE key = ?1", params![SELECTED_PEER_KEY])?,
        };
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.conn.execute_batch("DELETE FROM peers; DELETE FROM settings;")?;
        Ok(())
    }
}
