use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use kb_core::{FileType, ParserKind};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{RagError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "public" => Some(Visibility::Public),
            "private" => Some(Visibility::Private),
            _ => None,
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Knowledgebase {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub embedding_model: String,
    pub parser: ParserKind,
    pub token_num: u64,
    pub chunk_num: u64,
    pub doc_num: u64,
}

#[derive(Debug, Clone)]
pub struct NewKnowledgebase {
    pub tenant_id: String,
    pub name: String,
    pub embedding_model: String,
    pub parser: ParserKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub id: String,
    pub kb_id: String,
    pub name: String,
    pub location: String,
    pub size: u64,
    pub file_type: FileType,
    pub parser: ParserKind,
    pub created_by: String,
    pub visibility: Visibility,
    pub fingerprint: String,
    pub authorized_users: Vec<String>,
    pub thumbnail: Option<String>,
    pub token_num: u64,
    pub chunk_num: u64,
    pub process_duration: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct DocumentInsert {
    pub kb_id: String,
    pub name: String,
    pub location: String,
    pub size: u64,
    pub file_type: FileType,
    pub parser: ParserKind,
    pub created_by: String,
    pub visibility: Visibility,
    pub fingerprint: String,
}

#[derive(Clone)]
pub struct Catalog {
    path: PathBuf,
}

impl Catalog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let catalog = Self {
            path: path.as_ref().to_path_buf(),
        };
        catalog.init()?;
        Ok(catalog)
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        Ok(conn)
    }

    fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS knowledgebases (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                embedding_model TEXT NOT NULL,
                parser TEXT NOT NULL DEFAULT 'naive',
                token_num INTEGER NOT NULL DEFAULT 0,
                chunk_num INTEGER NOT NULL DEFAULT 0,
                doc_num INTEGER NOT NULL DEFAULT 0,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                kb_id TEXT NOT NULL,
                name TEXT NOT NULL,
                location TEXT NOT NULL,
                size INTEGER NOT NULL,
                file_type TEXT NOT NULL,
                parser TEXT NOT NULL,
                created_by TEXT NOT NULL,
                visibility TEXT NOT NULL DEFAULT 'private',
                fingerprint TEXT NOT NULL,
                authorized_users TEXT NOT NULL DEFAULT '[]',
                thumbnail TEXT,
                token_num INTEGER NOT NULL DEFAULT 0,
                chunk_num INTEGER NOT NULL DEFAULT 0,
                process_duration REAL NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(kb_id) REFERENCES knowledgebases(id)
            );
            CREATE INDEX IF NOT EXISTS idx_documents_kb ON documents(kb_id);
            CREATE INDEX IF NOT EXISTS idx_documents_fingerprint ON documents(fingerprint);
            "#,
        )?;
        Ok(())
    }

    pub fn create_knowledgebase(&self, kb: &NewKnowledgebase) -> Result<Knowledgebase> {
        let conn = self.connection()?;
        let id = Uuid::new_v4().simple().to_string();
        conn.execute(
            "INSERT INTO knowledgebases (id, tenant_id, name, embedding_model, parser) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, kb.tenant_id, kb.name, kb.embedding_model, kb.parser.as_str()],
        )?;
        info!(kb_id = %id, tenant = %kb.tenant_id, name = %kb.name, "knowledge base created");
        Ok(Knowledgebase {
            id,
            tenant_id: kb.tenant_id.clone(),
            name: kb.name.clone(),
            embedding_model: kb.embedding_model.clone(),
            parser: kb.parser,
            token_num: 0,
            chunk_num: 0,
            doc_num: 0,
        })
    }

    pub fn get_knowledgebase(&self, kb_id: &str) -> Result<Option<Knowledgebase>> {
        let conn = self.connection()?;
        Ok(conn
            .query_row(
                "SELECT id, tenant_id, name, embedding_model, parser, token_num, chunk_num, doc_num
                 FROM knowledgebases WHERE id = ?1",
                [kb_id],
                map_knowledgebase,
            )
            .optional()?)
    }

    pub fn list_knowledgebases(&self, tenant_id: &str) -> Result<Vec<Knowledgebase>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, name, embedding_model, parser, token_num, chunk_num, doc_num
             FROM knowledgebases WHERE tenant_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map([tenant_id], map_knowledgebase)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn insert_document(&self, doc: &DocumentInsert) -> Result<DocumentRecord> {
        let conn = self.connection()?;
        insert_document_row(&conn, &new_document_id(), doc, None)
    }

    // The row and the knowledge base `doc_num` land together or not at all.
    pub fn insert_document_counted(
        &self,
        doc_id: &str,
        doc: &DocumentInsert,
        thumbnail: Option<&str>,
    ) -> Result<DocumentRecord> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let record = insert_document_row(&tx, doc_id, doc, thumbnail)?;
        let kbs = tx.execute(
            "UPDATE knowledgebases SET doc_num = doc_num + 1 WHERE id = ?1",
            [&doc.kb_id],
        )?;
        if kbs == 0 {
            return Err(RagError::KnowledgebaseNotFound(doc.kb_id.clone()));
        }
        tx.commit()?;
        Ok(record)
    }

    pub fn get_document(&self, doc_id: &str) -> Result<Option<DocumentRecord>> {
        let conn = self.connection()?;
        Ok(conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
                [doc_id],
                map_document,
            )
            .optional()?)
    }

    pub fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<DocumentRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE fingerprint = ?1 ORDER BY created_at, rowid"
        ))?;
        let rows = stmt.query_map([fingerprint], map_document)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_documents(&self, kb_id: &str) -> Result<Vec<DocumentRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE kb_id = ?1 ORDER BY created_at, rowid"
        ))?;
        let rows = stmt.query_map([kb_id], map_document)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn document_count(&self, tenant_id: &str) -> Result<u64> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents JOIN knowledgebases ON documents.kb_id = knowledgebases.id
             WHERE knowledgebases.tenant_id = ?1",
            [tenant_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn document_name_exists(&self, kb_id: &str, name: &str) -> Result<bool> {
        let conn = self.connection()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM documents WHERE kb_id = ?1 AND name = ?2 LIMIT 1",
                params![kb_id, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn delete_document(&self, doc_id: &str) -> Result<bool> {
        let conn = self.connection()?;
        Ok(conn.execute("DELETE FROM documents WHERE id = ?1", [doc_id])? > 0)
    }

    pub fn add_authorized_user(&self, doc_id: &str, principal_id: &str) -> Result<Vec<String>> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<Value> = tx
            .query_row(
                "SELECT authorized_users FROM documents WHERE id = ?1",
                [doc_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(RagError::DocumentNotFound(doc_id.to_string()));
        };
        let mut users: Vec<String> = serde_json::from_value(current)?;
        if !users.iter().any(|u| u == principal_id) {
            users.push(principal_id.to_string());
            tx.execute(
                "UPDATE documents SET authorized_users = ?1 WHERE id = ?2",
                params![serde_json::to_value(&users)?, doc_id],
            )?;
        }
        tx.commit()?;
        Ok(users)
    }

    pub fn set_authorized_users(&self, doc_id: &str, users: &[String]) -> Result<()> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE documents SET authorized_users = ?1 WHERE id = ?2",
            params![serde_json::to_value(users)?, doc_id],
        )?;
        if updated == 0 {
            return Err(RagError::DocumentNotFound(doc_id.to_string()));
        }
        Ok(())
    }

    pub fn increment_chunk_num(
        &self,
        doc_id: &str,
        kb_id: &str,
        token_num: u64,
        chunk_num: u64,
        duration: f64,
    ) -> Result<()> {
        let tokens = to_sql_int(token_num)?;
        let chunks = to_sql_int(chunk_num)?;
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let docs = tx.execute(
            "UPDATE documents SET token_num = token_num + ?1, chunk_num = chunk_num + ?2,
             process_duration = process_duration + ?3 WHERE id = ?4",
            params![tokens, chunks, duration, doc_id],
        )?;
        if docs == 0 {
            return Err(RagError::DocumentNotFound(doc_id.to_string()));
        }
        let kbs = tx.execute(
            "UPDATE knowledgebases SET token_num = token_num + ?1, chunk_num = chunk_num + ?2 WHERE id = ?3",
            params![tokens, chunks, kb_id],
        )?;
        if kbs == 0 {
            return Err(RagError::KnowledgebaseNotFound(kb_id.to_string()));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn decrement_chunk_num(
        &self,
        doc_id: &str,
        kb_id: &str,
        token_num: u64,
        chunk_num: u64,
        duration: f64,
    ) -> Result<()> {
        let tokens = to_sql_int(token_num)?;
        let chunks = to_sql_int(chunk_num)?;
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let docs = tx.execute(
            "UPDATE documents SET token_num = MAX(token_num - ?1, 0), chunk_num = MAX(chunk_num - ?2, 0),
             process_duration = MAX(process_duration - ?3, 0) WHERE id = ?4",
            params![tokens, chunks, duration, doc_id],
        )?;
        if docs == 0 {
            return Err(RagError::DocumentNotFound(doc_id.to_string()));
        }
        let kbs = tx.execute(
            "UPDATE knowledgebases SET token_num = MAX(token_num - ?1, 0), chunk_num = MAX(chunk_num - ?2, 0)
             WHERE id = ?3",
            params![tokens, chunks, kb_id],
        )?;
        if kbs == 0 {
            return Err(RagError::KnowledgebaseNotFound(kb_id.to_string()));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn clear_chunk_num(&self, doc_id: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let totals: Option<(String, i64, i64)> = tx
            .query_row(
                "SELECT kb_id, token_num, chunk_num FROM documents WHERE id = ?1",
                [doc_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((kb_id, tokens, chunks)) = totals else {
            return Err(RagError::DocumentNotFound(doc_id.to_string()));
        };
        let kbs = tx.execute(
            "UPDATE knowledgebases SET token_num = MAX(token_num - ?1, 0), chunk_num = MAX(chunk_num - ?2, 0),
             doc_num = MAX(doc_num - 1, 0) WHERE id = ?3",
            params![tokens, chunks, kb_id],
        )?;
        if kbs == 0 {
            return Err(RagError::KnowledgebaseNotFound(kb_id));
        }
        tx.execute(
            "UPDATE documents SET token_num = 0, chunk_num = 0 WHERE id = ?1",
            [doc_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn increase_doc_num(&self, kb_id: &str) -> Result<()> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE knowledgebases SET doc_num = doc_num + 1 WHERE id = ?1",
            [kb_id],
        )?;
        if updated == 0 {
            return Err(RagError::KnowledgebaseNotFound(kb_id.to_string()));
        }
        Ok(())
    }
}

pub fn new_document_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn insert_document_row(
    conn: &Connection,
    id: &str,
    doc: &DocumentInsert,
    thumbnail: Option<&str>,
) -> Result<DocumentRecord> {
    let created_at = now_millis();
    conn.execute(
        "INSERT INTO documents (id, kb_id, name, location, size, file_type, parser, created_by, visibility, fingerprint, thumbnail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            id,
            doc.kb_id,
            doc.name,
            doc.location,
            to_sql_int(doc.size)?,
            doc.file_type.as_str(),
            doc.parser.as_str(),
            doc.created_by,
            doc.visibility.as_str(),
            doc.fingerprint,
            thumbnail,
            created_at
        ],
    )?;
    debug!(doc_id = %id, kb_id = %doc.kb_id, name = %doc.name, "document inserted");
    Ok(DocumentRecord {
        id: id.to_string(),
        kb_id: doc.kb_id.clone(),
        name: doc.name.clone(),
        location: doc.location.clone(),
        size: doc.size,
        file_type: doc.file_type,
        parser: doc.parser,
        created_by: doc.created_by.clone(),
        visibility: doc.visibility,
        fingerprint: doc.fingerprint.clone(),
        authorized_users: Vec::new(),
        thumbnail: thumbnail.map(str::to_string),
        token_num: 0,
        chunk_num: 0,
        process_duration: 0.0,
        created_at,
    })
}

const DOCUMENT_COLUMNS: &str = "id, kb_id, name, location, size, file_type, parser, created_by, visibility, \
     fingerprint, authorized_users, thumbnail, token_num, chunk_num, process_duration, created_at";

fn map_knowledgebase(row: &Row<'_>) -> rusqlite::Result<Knowledgebase> {
    let parser: String = row.get(4)?;
    Ok(Knowledgebase {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        embedding_model: row.get(3)?,
        parser: ParserKind::parse(&parser).unwrap_or(ParserKind::Naive),
        token_num: row.get::<_, i64>(5)?.max(0) as u64,
        chunk_num: row.get::<_, i64>(6)?.max(0) as u64,
        doc_num: row.get::<_, i64>(7)?.max(0) as u64,
    })
}

fn map_document(row: &Row<'_>) -> rusqlite::Result<DocumentRecord> {
    let file_type: String = row.get(5)?;
    let parser: String = row.get(6)?;
    let visibility: String = row.get(8)?;
    let users: Value = row.get(10)?;
    let authorized_users = serde_json::from_value(users).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(DocumentRecord {
        id: row.get(0)?,
        kb_id: row.get(1)?,
        name: row.get(2)?,
        location: row.get(3)?,
        size: row.get::<_, i64>(4)?.max(0) as u64,
        file_type: FileType::parse(&file_type).unwrap_or(FileType::Other),
        parser: ParserKind::parse(&parser).unwrap_or(ParserKind::Naive),
        created_by: row.get(7)?,
        visibility: Visibility::parse(&visibility).unwrap_or_default(),
        fingerprint: row.get(9)?,
        authorized_users,
        thumbnail: row.get(11)?,
        token_num: row.get::<_, i64>(12)?.max(0) as u64,
        chunk_num: row.get::<_, i64>(13)?.max(0) as u64,
        process_duration: row.get(14)?,
        created_at: row.get(15)?,
    })
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| RagError::Config(format!("{value} does not fit a sqlite integer")))
}
