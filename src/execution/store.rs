use crate::execution::context::ContextSnapshot;
use crate::execution::error::ExecutionError;
use crate::execution::interaction::Interaction;
use crate::execution::session::ExecutionSession;
use crate::execution::step::SessionPlan;
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::ids::{InteractionId, SessionId};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Durable home for sessions, context snapshots and interactions. Every
/// `save_*` returns only once the write is durable; callers rely on that to
/// order persistence before publication.
pub trait SessionStore: Send + Sync {
    fn save_session(&self, session: &ExecutionSession) -> Result<(), ExecutionError>;
    fn load_session(&self, session_id: &SessionId)
        -> Result<Option<ExecutionSession>, ExecutionError>;
    fn list_sessions(&self) -> Result<Vec<ExecutionSession>, ExecutionError>;

    /// The plan a session was started with, kept so a later process can
    /// resume it without the caller supplying the steps again.
    fn save_plan(&self, session_id: &SessionId, plan: &SessionPlan) -> Result<(), ExecutionError>;
    fn load_plan(&self, session_id: &SessionId) -> Result<Option<SessionPlan>, ExecutionError>;

    fn save_snapshot(&self, snapshot: &ContextSnapshot) -> Result<(), ExecutionError>;
    fn load_snapshot(&self, session_id: &SessionId)
        -> Result<Option<ContextSnapshot>, ExecutionError>;

    fn save_interaction(&self, interaction: &Interaction) -> Result<(), ExecutionError>;
    fn load_interaction(
        &self,
        interaction_id: &InteractionId,
    ) -> Result<Option<Interaction>, ExecutionError>;
    fn list_interactions(&self, session_id: &SessionId)
        -> Result<Vec<Interaction>, ExecutionError>;
}

/// JSON documents under the state root: `sessions/<id>/session.json`,
/// `sessions/<id>/plan.json`, `sessions/<id>/snapshot.json` and
/// `interactions/<id>.json`.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    state_root: PathBuf,
}

impl FileSessionStore {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    fn sessions_dir(&self) -> PathBuf {
        self.state_root.join("sessions")
    }

    fn session_path(&self, session_id: &SessionId) -> PathBuf {
        self.sessions_dir()
            .join(session_id.as_str())
            .join("session.json")
    }

    fn snapshot_path(&self, session_id: &SessionId) -> PathBuf {
        self.sessions_dir()
            .join(session_id.as_str())
            .join("snapshot.json")
    }

    fn plan_path(&self, session_id: &SessionId) -> PathBuf {
        self.sessions_dir().join(session_id.as_str()).join("plan.json")
    }

    fn interactions_dir(&self) -> PathBuf {
        self.state_root.join("interactions")
    }

    fn interaction_path(&self, interaction_id: &InteractionId) -> PathBuf {
        self.interactions_dir()
            .join(format!("{}.json", interaction_id.as_str()))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ExecutionError {
    ExecutionError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn json_error(path: &Path, source: serde_json::Error) -> ExecutionError {
    ExecutionError::Json {
        path: path.display().to_string(),
        source,
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ExecutionError> {
    atomic_write_json(path, value).map_err(|err| io_error(path, err))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ExecutionError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(path, err)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| json_error(path, err))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, ExecutionError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(dir, err)),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| io_error(dir, err))?;
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

impl SessionStore for FileSessionStore {
    fn save_session(&self, session: &ExecutionSession) -> Result<(), ExecutionError> {
        write_json(&self.session_path(&session.session_id), session)
    }

    fn load_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ExecutionSession>, ExecutionError> {
        read_json(&self.session_path(session_id))
    }

    fn list_sessions(&self) -> Result<Vec<ExecutionSession>, ExecutionError> {
        let mut sessions = Vec::new();
        for dir in sorted_entries(&self.sessions_dir())? {
            let path = dir.join("session.json");
            if let Some(session) = read_json::<ExecutionSession>(&path)? {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.as_str().cmp(b.session_id.as_str()))
        });
        Ok(sessions)
    }

    fn save_plan(&self, session_id: &SessionId, plan: &SessionPlan) -> Result<(), ExecutionError> {
        write_json(&self.plan_path(session_id), plan)
    }

    fn load_plan(&self, session_id: &SessionId) -> Result<Option<SessionPlan>, ExecutionError> {
        read_json(&self.plan_path(session_id))
    }

    fn save_snapshot(&self, snapshot: &ContextSnapshot) -> Result<(), ExecutionError> {
        write_json(&self.snapshot_path(&snapshot.session_id), snapshot)
    }

    fn load_snapshot(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ContextSnapshot>, ExecutionError> {
        read_json(&self.snapshot_path(session_id))
    }

    fn save_interaction(&self, interaction: &Interaction) -> Result<(), ExecutionError> {
        write_json(&self.interaction_path(&interaction.interaction_id), interaction)
    }

    fn load_interaction(
        &self,
        interaction_id: &InteractionId,
    ) -> Result<Option<Interaction>, ExecutionError> {
        read_json(&self.interaction_path(interaction_id))
    }

    fn list_interactions(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<Interaction>, ExecutionError> {
        let mut interactions = Vec::new();
        for path in sorted_entries(&self.interactions_dir())? {
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(interaction) = read_json::<Interaction>(&path)? {
                if &interaction.session_id == session_id {
                    interactions.push(interaction);
                }
            }
        }
        interactions.sort_by_key(|interaction| interaction.created_at);
        Ok(interactions)
    }
}

/// Same documents as [`FileSessionStore`], kept as JSON bodies in SQLite
/// with the fields we query on lifted into columns.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    db_path: PathBuf,
}

impl SqliteSessionStore {
    pub fn open(db_path: &Path) -> Result<Self, ExecutionError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(&self) -> Result<(), ExecutionError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    session_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    body TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS plans (
                    session_id TEXT PRIMARY KEY,
                    body TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS snapshots (
                    session_id TEXT PRIMARY KEY,
                    taken_at INTEGER NOT NULL,
                    body TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS interactions (
                    interaction_id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    body TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS interactions_by_session
                    ON interactions(session_id, created_at);
                ",
            )
            .map_err(|source| self.sql_error(source))
    }

    fn connect(&self) -> Result<Connection, ExecutionError> {
        let connection = Connection::open(&self.db_path).map_err(|source| self.sql_error(source))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .map_err(|source| self.sql_error(source))?;
        connection
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(|source| self.sql_error(source))?;
        Ok(connection)
    }

    fn sql_error(&self, source: rusqlite::Error) -> ExecutionError {
        ExecutionError::Sqlite {
            path: self.db_path.display().to_string(),
            source,
        }
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<String, ExecutionError> {
        serde_json::to_string(value).map_err(|err| json_error(&self.db_path, err))
    }

    fn decode<T: DeserializeOwned>(&self, body: &str) -> Result<T, ExecutionError> {
        serde_json::from_str(body).map_err(|err| json_error(&self.db_path, err))
    }

    fn load_body(&self, sql: &str, key: &str) -> Result<Option<String>, ExecutionError> {
        let connection = self.connect()?;
        connection
            .query_row(sql, params![key], |row| row.get::<_, String>(0))
            .optional()
            .map_err(|source| self.sql_error(source))
    }

    fn load_bodies(&self, sql: &str, key: Option<&str>) -> Result<Vec<String>, ExecutionError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(sql)
            .map_err(|source| self.sql_error(source))?;
        let rows = statement
            .query_map(params_from_iter(key.iter()), |row| row.get::<_, String>(0))
            .map_err(|source| self.sql_error(source))?;

        let mut bodies = Vec::new();
        for row in rows {
            bodies.push(row.map_err(|source| self.sql_error(source))?);
        }
        Ok(bodies)
    }
}

impl SessionStore for SqliteSessionStore {
    fn save_session(&self, session: &ExecutionSession) -> Result<(), ExecutionError> {
        let body = self.encode(session)?;
        let connection = self.connect()?;
        connection
            .execute(
                "
                INSERT INTO sessions (session_id, status, created_at, updated_at, body)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(session_id) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at,
                    body = excluded.body
                ",
                params![
                    session.session_id.as_str(),
                    session.status.as_str(),
                    session.created_at,
                    session.updated_at,
                    body
                ],
            )
            .map_err(|source| self.sql_error(source))?;
        Ok(())
    }

    fn load_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ExecutionSession>, ExecutionError> {
        self.load_body(
            "SELECT body FROM sessions WHERE session_id = ?1",
            session_id.as_str(),
        )?
        .map(|body| self.decode(&body))
        .transpose()
    }

    fn list_sessions(&self) -> Result<Vec<ExecutionSession>, ExecutionError> {
        self.load_bodies(
            "SELECT body FROM sessions ORDER BY created_at ASC, session_id ASC",
            None,
        )?
        .iter()
        .map(|body| self.decode(body))
        .collect()
    }

    fn save_plan(&self, session_id: &SessionId, plan: &SessionPlan) -> Result<(), ExecutionError> {
        let body = self.encode(plan)?;
        let connection = self.connect()?;
        connection
            .execute(
                "
                INSERT INTO plans (session_id, body)
                VALUES (?1, ?2)
                ON CONFLICT(session_id) DO UPDATE SET body = excluded.body
                ",
                params![session_id.as_str(), body],
            )
            .map_err(|source| self.sql_error(source))?;
        Ok(())
    }

    fn load_plan(&self, session_id: &SessionId) -> Result<Option<SessionPlan>, ExecutionError> {
        self.load_body(
            "SELECT body FROM plans WHERE session_id = ?1",
            session_id.as_str(),
        )?
        .map(|body| self.decode(&body))
        .transpose()
    }

    fn save_snapshot(&self, snapshot: &ContextSnapshot) -> Result<(), ExecutionError> {
        let body = self.encode(snapshot)?;
        let connection = self.connect()?;
        connection
            .execute(
                "
                INSERT INTO snapshots (session_id, taken_at, body)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(session_id) DO UPDATE SET
                    taken_at = excluded.taken_at,
                    body = excluded.body
                ",
                params![snapshot.session_id.as_str(), snapshot.taken_at, body],
            )
            .map_err(|source| self.sql_error(source))?;
        Ok(())
    }

    fn load_snapshot(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ContextSnapshot>, ExecutionError> {
        self.load_body(
            "SELECT body FROM snapshots WHERE session_id = ?1",
            session_id.as_str(),
        )?
        .map(|body| self.decode(&body))
        .transpose()
    }

    fn save_interaction(&self, interaction: &Interaction) -> Result<(), ExecutionError> {
        let body = self.encode(interaction)?;
        let connection = self.connect()?;
        connection
            .execute(
                "
                INSERT INTO interactions (interaction_id, session_id, status, created_at, body)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(interaction_id) DO UPDATE SET
                    status = excluded.status,
                    body = excluded.body
                ",
                params![
                    interaction.interaction_id.as_str(),
                    interaction.session_id.as_str(),
                    interaction.status.as_str(),
                    interaction.created_at,
                    body
                ],
            )
            .map_err(|source| self.sql_error(source))?;
        Ok(())
    }

    fn load_interaction(
        &self,
        interaction_id: &InteractionId,
    ) -> Result<Option<Interaction>, ExecutionError> {
        self.load_body(
            "SELECT body FROM interactions WHERE interaction_id = ?1",
            interaction_id.as_str(),
        )?
        .map(|body| self.decode(&body))
        .transpose()
    }

    fn list_interactions(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<Interaction>, ExecutionError> {
        self.load_bodies(
            "
            SELECT body FROM interactions
            WHERE session_id = ?1
            ORDER BY created_at ASC, interaction_id ASC
            ",
            Some(session_id.as_str()),
        )?
        .iter()
        .map(|body| self.decode(body))
        .collect()
    }
}
