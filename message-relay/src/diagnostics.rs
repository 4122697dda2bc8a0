//! Append-only diagnostic log shared by every connection.
//!
//! Writers are serialized behind one mutex so each record lands as a whole
//! line. Records are also forwarded to `tracing`, which is where debug-level
//! records end up: they are never written to the file. A failed append is
//! dropped; logging never fails a relay.

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use chrono::Local;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, error, info};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const LOG_DIR: &str = "MessageRelayLogs";
const LOG_FILE: &str = "MessageRelayLogs.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Error => "ERROR",
        };
        f.write_str(text)
    }
}

pub struct DiagnosticLog {
    path: Option<PathBuf>,
    writer: Mutex<()>,
}

impl DiagnosticLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            writer: Mutex::new(()),
        }
    }

    /// A log that only forwards to `tracing`.
    pub fn disabled() -> Self {
        Self {
            path: None,
            writer: Mutex::new(()),
        }
    }

    /// `<local data dir>/message-relay/MessageRelayLogs/MessageRelayLogs.txt`,
    /// or the same layout under the working directory when the platform has
    /// no data dir.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("message-relay")
            .join(LOG_DIR)
            .join(LOG_FILE)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn write(&self, level: Level, message: &str) {
        match level {
            Level::Debug => debug!("{message}"),
            Level::Info => info!("{message}"),
            Level::Error => error!("{message}"),
        }

        if level == Level::Debug {
            return;
        }
        let Some(path) = &self.path else {
            return;
        };

        let record = format!(
            "{} - {} - {}\n",
            Local::now().format(TIMESTAMP_FORMAT),
            level,
            message
        );

        let _writer = self.writer.lock().await;
        if let Err(err) = append(path, record.as_bytes()).await {
            debug!(?err, path = %path.display(), "dropped diagnostic record");
        }
    }

    pub async fn debug(&self, message: &str) {
        self.write(Level::Debug, message).await;
    }

    pub async fn info(&self, message: &str) {
        self.write(Level::Info, message).await;
    }

    pub async fn error(&self, message: &str) {
        self.write(Level::Error, message).await;
    }
}

async fn append(path: &Path, record: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    file.write_all(record).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future::join_all;

    use super::*;

    async fn read_lines(path: &Path) -> Vec<String> {
        tokio::fs::read_to_string(path)
            .await
            .expect("read log")
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn records_use_the_timestamp_level_message_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("relay.log");
        let log = DiagnosticLog::open(&path);

        log.info("Connection opened: #1").await;
        log.error("Error sending to #2 - unknown").await;

        let lines = read_lines(&path).await;
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - INFO - Connection opened: #1"));
        assert!(lines[1].ends_with(" - ERROR - Error sending to #2 - unknown"));

        let timestamp = lines[0].split(" - ").next().expect("timestamp");
        assert!(chrono::NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).is_ok());
    }

    #[tokio::test]
    async fn debug_records_are_not_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay.log");
        let log = DiagnosticLog::open(&path);

        log.debug("Request initiated by #1").await;

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unavailable_target_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A regular file where the parent directory should be.
        let blocker = dir.path().join("blocker");
        tokio::fs::write(&blocker, b"").await.expect("write blocker");
        let log = DiagnosticLog::open(blocker.join("relay.log"));

        log.error("this goes nowhere").await;
        log.info("neither does this").await;
    }

    #[tokio::test]
    async fn concurrent_writes_produce_whole_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay.log");
        let log = Arc::new(DiagnosticLog::open(&path));
        let payload = "x".repeat(512);

        let writers = (0..64).map(|n| {
            let log = Arc::clone(&log);
            let message = format!("writer {n} {payload}");
            tokio::spawn(async move { log.info(&message).await })
        });
        for result in join_all(writers).await {
            result.expect("writer task");
        }

        let lines = read_lines(&path).await;
        assert_eq!(lines.len(), 64);
        let mut writers_seen: Vec<usize> = lines
            .iter()
            .map(|line| {
                let (_, message) = line.split_once(" - INFO - ").expect("level separator");
                let rest = message.strip_prefix("writer ").expect("writer prefix");
                let (n, tail) = rest.split_once(' ').expect("payload separator");
                assert_eq!(tail, payload);
                n.parse().expect("writer number")
            })
            .collect();
        writers_seen.sort_unstable();
        assert_eq!(writers_seen, (0..64).collect::<Vec<_>>());
    }
}
