use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage id '{raw}' is invalid for {id_type}: {details}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        details: &'static str,
    },
    #[snafu(display("attachment '{name}' has a malformed payload: {details}"))]
    InvalidAttachmentPayload {
        stage: &'static str,
        name: String,
        details: &'static str,
    },
    #[snafu(display("attachment '{name}' payload is not valid base64"))]
    AttachmentBase64 {
        stage: &'static str,
        name: String,
        source: base64::DecodeError,
    },
    #[snafu(display("failed to encode {namespace} value for key '{key}'"))]
    EncodeValue {
        stage: &'static str,
        namespace: &'static str,
        key: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode {namespace} value for key '{key}'"))]
    DecodeValue {
        stage: &'static str,
        namespace: &'static str,
        key: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to configure sqlite pragma '{pragma}'"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Failures talking to the remote session-sync service.
///
/// None of these ever escape [`crate::SessionStore`]; they only decide which
/// fallback path runs.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("remote session sync is not configured"))]
    NotConfigured { stage: &'static str },
    #[snafu(display("remote sync request failed on `{stage}`, {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("remote sync timed out on `{stage}` after {timeout_ms}ms"))]
    Timeout { stage: &'static str, timeout_ms: u64 },
    #[snafu(display("remote sync `{stage}` returned status {status}: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("remote sync has no {resource}"))]
    NotFound {
        stage: &'static str,
        resource: String,
    },
    #[snafu(display("failed to decode remote sync payload on `{stage}`, {source}"))]
    Decode {
        stage: &'static str,
        source: reqwest::Error,
    },
}

impl SyncError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
