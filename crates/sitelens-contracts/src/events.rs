use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type EventPayload = Map<String, Value>;

enum WriterCommand {
    Line(String),
    Flush(Sender<Option<String>>),
}

/// Append-only JSONL log of analysis events.
///
/// Lines are handed to one background writer thread that owns the file, so
/// callers on async workers never touch the filesystem. Every line carries
/// `type`, `session_id` and `ts`, followed by the caller's payload.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    session_id: String,
    sender: Sender<WriterCommand>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_session(path, Uuid::new_v4().to_string())
    }

    pub fn with_session(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        let path = path.into();
        let (sender, receiver) = mpsc::channel();
        let writer_path = path.clone();
        let spawned = thread::Builder::new()
            .name("sitelens-events".to_string())
            .spawn(move || run_writer(&writer_path, receiver));
        if let Err(err) = spawned {
            tracing::warn!(path = %path.display(), "event writer did not start: {err}");
        }
        Self {
            inner: Arc::new(EventLogInner {
                path,
                session_id: session_id.into(),
                sender,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Queues one event line and returns the full event. Never blocks on I/O.
    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let line = serde_json::to_string(&event)?;
        self.inner
            .sender
            .send(WriterCommand::Line(line))
            .map_err(|_| anyhow!("event writer for {} has stopped", self.inner.path.display()))?;
        Ok(Value::Object(event))
    }

    /// Like [`EventLog::emit`], but only logs a warning on failure.
    pub fn record(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.emit(event_type, payload) {
            tracing::warn!(
                event = event_type,
                path = %self.inner.path.display(),
                "failed to queue event: {err:#}"
            );
        }
    }

    /// Waits until every queued line is on disk. Reports the most recent
    /// write failure since the previous flush.
    ///
    /// Blocks the calling thread; call it at shutdown, not from request handlers.
    pub fn flush(&self) -> anyhow::Result<()> {
        let (reply, done) = mpsc::channel();
        self.inner
            .sender
            .send(WriterCommand::Flush(reply))
            .map_err(|_| anyhow!("event writer for {} has stopped", self.inner.path.display()))?;
        match done.recv() {
            Ok(None) => Ok(()),
            Ok(Some(err)) => bail!("event log {}: {err}", self.inner.path.display()),
            Err(_) => bail!("event writer for {} has stopped", self.inner.path.display()),
        }
    }
}

/// Owns the log file for the lifetime of the channel. The file is opened on
/// the first line; a failed open is retried on the next one.
fn run_writer(path: &Path, receiver: Receiver<WriterCommand>) {
    let mut file: Option<File> = None;
    let mut last_error: Option<String> = None;
    for command in receiver {
        match command {
            WriterCommand::Line(line) => {
                if let Err(err) = append_line(path, &mut file, &line) {
                    tracing::warn!(path = %path.display(), "failed to write event: {err}");
                    file = None;
                    last_error = Some(err.to_string());
                }
            }
            WriterCommand::Flush(reply) => {
                if let Some(open) = file.as_mut() {
                    if let Err(err) = open.flush() {
                        last_error = Some(err.to_string());
                    }
                }
                let _ = reply.send(last_error.take());
            }
        }
    }
}

fn append_line(path: &Path, file: &mut Option<File>, line: &str) -> std::io::Result<()> {
    if file.is_none() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        *file = Some(OpenOptions::new().create(true).append(true).open(path)?);
    }
    if let Some(open) = file.as_mut() {
        let mut buffer = String::with_capacity(line.len() + 1);
        buffer.push_str(line);
        buffer.push('\n');
        open.write_all(buffer.as_bytes())?;
    }
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
