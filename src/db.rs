use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::config::AppConfig;
use crate::models::{
    AnalysisRecord, DocumentChunk, DocumentContent, FileRecord, Material, MaterialBinding,
    MaterialKind, Project, TaskKind, TaskRecord, TaskState, TenderAnalysis,
};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        Self::connect(&config.sqlite_dsn()).await
    }

    pub async fn connect(dsn: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        // raw_sql: the schema is a multi-statement batch.
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'Draft',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                filename TEXT NOT NULL,
                object_name TEXT NOT NULL UNIQUE,
                content_type TEXT,
                size INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tender_analyses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                summary TEXT NOT NULL,
                key_dates_json TEXT NOT NULL,
                document_structure_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS document_contents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL UNIQUE,
                content_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS document_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                file_id INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS materials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                url TEXT NOT NULL,
                uploaded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS material_bindings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                placeholder_key TEXT NOT NULL,
                material_id INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                state TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0.0,
                result_json TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // --- projects ---

    pub async fn create_project(&self, name: &str, description: Option<&str>) -> Result<Project> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO projects (name, description, status, created_at, updated_at) VALUES (?, ?, 'Draft', ?, ?)",
        )
        .bind(name)
        .bind(description)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Project {
            id,
            name: name.to_string(),
            description: description.map(str::to_string),
            status: "Draft".to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT id, name, description, status, created_at, updated_at FROM projects ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_project).collect())
    }

    pub async fn get_project(&self, project_id: i64) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, name, description, status, created_at, updated_at FROM projects WHERE id = ?",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_project))
    }

    pub async fn update_project_status(&self, project_id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().to_rfc3339())
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_project(&self, project_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- files ---

    pub async fn insert_file(
        &self,
        project_id: i64,
        filename: &str,
        object_name: &str,
        content_type: Option<&str>,
        size: i64,
    ) -> Result<FileRecord> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO files (project_id, filename, object_name, content_type, size, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(filename)
        .bind(object_name)
        .bind(content_type)
        .bind(size)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(FileRecord {
            id,
            project_id,
            filename: filename.to_string(),
            object_name: object_name.to_string(),
            content_type: content_type.map(str::to_string),
            size: Some(size),
            created_at: now,
        })
    }

    /// Newest first; the head drives the staleness check and leads the raw
    /// excerpt assembly.
    pub async fn files_for_project(&self, project_id: i64) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            "SELECT id, project_id, filename, object_name, content_type, size, created_at FROM files WHERE project_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_file).collect())
    }

    pub async fn get_file(&self, file_id: i64) -> Result<Option<FileRecord>> {
        let row = sqlx::query(
            "SELECT id, project_id, filename, object_name, content_type, size, created_at FROM files WHERE id = ?",
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_file))
    }

    // --- analysis records ---

    pub async fn latest_analysis(&self, project_id: i64) -> Result<Option<AnalysisRecord>> {
        let row = sqlx::query(
            "SELECT id, project_id, summary, key_dates_json, document_structure_json, updated_at FROM tender_analyses WHERE project_id = ? ORDER BY updated_at DESC, id DESC LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_analysis))
    }

    /// Update the latest record in place when one exists, insert otherwise.
    pub async fn upsert_analysis(
        &self,
        project_id: i64,
        analysis: &TenderAnalysis,
    ) -> Result<()> {
        let key_dates_json = serde_json::to_string(&analysis.key_dates)?;
        let structure_json = serde_json::to_string(&analysis.document_structure)?;
        let now = Utc::now().to_rfc3339();

        let existing = self.latest_analysis(project_id).await?;
        match existing {
            Some(record) => {
                sqlx::query(
                    "UPDATE tender_analyses SET summary = ?, key_dates_json = ?, document_structure_json = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&analysis.summary)
                .bind(&key_dates_json)
                .bind(&structure_json)
                .bind(&now)
                .bind(record.id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO tender_analyses (project_id, summary, key_dates_json, document_structure_json, updated_at) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(project_id)
                .bind(&analysis.summary)
                .bind(&key_dates_json)
                .bind(&structure_json)
                .bind(&now)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    // --- document content ---

    pub async fn document_content(&self, project_id: i64) -> Result<Option<DocumentContent>> {
        let row = sqlx::query("SELECT content_json FROM document_contents WHERE project_id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|r| {
            serde_json::from_str::<DocumentContent>(&r.get::<String, _>("content_json")).ok()
        }))
    }

    pub async fn save_document_content(
        &self,
        project_id: i64,
        content: &DocumentContent,
    ) -> Result<()> {
        let json = serde_json::to_string(content)?;
        sqlx::query(
            r#"
            INSERT INTO document_contents (project_id, content_json, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(project_id) DO UPDATE SET
                content_json = excluded.content_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(project_id)
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- chunk store (append-only) ---

    pub async fn append_chunks(
        &self,
        project_id: i64,
        file_id: i64,
        chunks: &[String],
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for (index, content) in chunks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO document_chunks (project_id, file_id, chunk_index, content, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(project_id)
            .bind(file_id)
            .bind(index as i64)
            .bind(content)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Storage order (insertion order), the tie-break order for ranking.
    pub async fn chunks_for_project(&self, project_id: i64) -> Result<Vec<DocumentChunk>> {
        let rows = sqlx::query(
            "SELECT id, project_id, file_id, chunk_index, content FROM document_chunks WHERE project_id = ? ORDER BY id ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    // --- materials ---

    pub async fn insert_material(
        &self,
        kind: MaterialKind,
        name: &str,
        size: i64,
        url: &str,
    ) -> Result<Material> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO materials (kind, name, size, url, uploaded_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(kind.as_str())
        .bind(name)
        .bind(size)
        .bind(url)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Material {
            id,
            kind,
            name: name.to_string(),
            size,
            url: url.to_string(),
            uploaded_at: now,
        })
    }

    pub async fn list_materials(&self) -> Result<Vec<Material>> {
        let rows = sqlx::query(
            "SELECT id, kind, name, size, url, uploaded_at FROM materials ORDER BY uploaded_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_material).collect())
    }

    pub async fn get_material(&self, material_id: i64) -> Result<Option<Material>> {
        let row =
            sqlx::query("SELECT id, kind, name, size, url, uploaded_at FROM materials WHERE id = ?")
                .bind(material_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(row_to_material))
    }

    // --- material bindings ---

    pub async fn insert_binding(
        &self,
        project_id: i64,
        placeholder_key: &str,
        material_id: i64,
    ) -> Result<MaterialBinding> {
        let id = sqlx::query(
            "INSERT INTO material_bindings (project_id, placeholder_key, material_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(placeholder_key)
        .bind(material_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(MaterialBinding {
            id,
            project_id,
            placeholder_key: placeholder_key.to_string(),
            material_id,
        })
    }

    pub async fn bindings_for_project(&self, project_id: i64) -> Result<Vec<MaterialBinding>> {
        let rows = sqlx::query(
            "SELECT id, project_id, placeholder_key, material_id FROM material_bindings WHERE project_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_binding).collect())
    }

    pub async fn delete_binding(&self, binding_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM material_bindings WHERE id = ?")
            .bind(binding_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- tasks ---

    pub async fn create_task(&self, project_id: i64, kind: TaskKind) -> Result<TaskRecord> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO tasks (project_id, kind, state, progress, created_at, updated_at) VALUES (?, ?, 'Pending', 0.0, ?, ?)",
        )
        .bind(project_id)
        .bind(kind.as_str())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(TaskRecord {
            id,
            project_id,
            kind,
            state: TaskState::Pending,
            progress: 0.0,
            result_json: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn update_task(
        &self,
        task_id: i64,
        state: TaskState,
        progress: f64,
        result_json: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET state = ?, progress = ?, result_json = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(progress)
        .bind(result_json)
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>> {
        let row = sqlx::query(
            "SELECT id, project_id, kind, state, progress, result_json, error_message, created_at, updated_at FROM tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_task))
    }

    pub async fn latest_task(
        &self,
        project_id: i64,
        kind: TaskKind,
    ) -> Result<Option<TaskRecord>> {
        let row = sqlx::query(
            "SELECT id, project_id, kind, state, progress, result_json, error_message, created_at, updated_at FROM tasks WHERE project_id = ? AND kind = ? ORDER BY updated_at DESC, id DESC LIMIT 1",
        )
        .bind(project_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_task))
    }
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_project(row: SqliteRow) -> Project {
    Project {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        status: row.get("status"),
        created_at: parse_time(&row.get::<String, _>("created_at")),
        updated_at: parse_time(&row.get::<String, _>("updated_at")),
    }
}

fn row_to_file(row: SqliteRow) -> FileRecord {
    FileRecord {
        id: row.get("id"),
        project_id: row.get("project_id"),
        filename: row.get("filename"),
        object_name: row.get("object_name"),
        content_type: row.get("content_type"),
        size: row.get("size"),
        created_at: parse_time(&row.get::<String, _>("created_at")),
    }
}

fn row_to_analysis(row: SqliteRow) -> AnalysisRecord {
    AnalysisRecord {
        id: row.get("id"),
        project_id: row.get("project_id"),
        summary: row.get("summary"),
        key_dates: serde_json::from_str(&row.get::<String, _>("key_dates_json"))
            .unwrap_or_default(),
        document_structure: serde_json::from_str(&row.get::<String, _>("document_structure_json"))
            .unwrap_or_default(),
        updated_at: parse_time(&row.get::<String, _>("updated_at")),
    }
}

fn row_to_chunk(row: SqliteRow) -> DocumentChunk {
    DocumentChunk {
        id: row.get("id"),
        project_id: row.get("project_id"),
        file_id: row.get("file_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
    }
}

fn row_to_material(row: SqliteRow) -> Material {
    Material {
        id: row.get("id"),
        kind: MaterialKind::from_db(&row.get::<String, _>("kind")),
        name: row.get("name"),
        size: row.get("size"),
        url: row.get("url"),
        uploaded_at: parse_time(&row.get::<String, _>("uploaded_at")),
    }
}

fn row_to_binding(row: SqliteRow) -> MaterialBinding {
    MaterialBinding {
        id: row.get("id"),
        project_id: row.get("project_id"),
        placeholder_key: row.get("placeholder_key"),
        material_id: row.get("material_id"),
    }
}

fn row_to_task(row: SqliteRow) -> TaskRecord {
    TaskRecord {
        id: row.get("id"),
        project_id: row.get("project_id"),
        kind: TaskKind::from_db(&row.get::<String, _>("kind")),
        state: TaskState::from_db(&row.get::<String, _>("state")),
        progress: row.get("progress"),
        result_json: row.get("result_json"),
        error_message: row.get("error_message"),
        created_at: parse_time(&row.get::<String, _>("created_at")),
        updated_at: parse_time(&row.get::<String, _>("updated_at")),
    }
}
