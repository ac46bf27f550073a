// ===============================
// src/recorder.rs
// ===============================
//
// Durable log sink (JSONL):
// - Every gateway log/error line is appended to one .jsonl file.
// - BufWriter, flushed every 1s and/or every 1000 lines.
// - Parent directory is created on open.
// - On write failure the file is reopened once; the line is dropped if that
//   fails too.
// - Producers never wait: lines are queued with try_send, a full or closed
//   queue is reported back as SinkError and the caller carries on.
//
// ENV: set `LOG_FILE=/path/to/gateway.jsonl` to enable (see config.rs).
//
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::error::SinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Level { Info, Error }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub ts: DateTime<Utc>,
    pub level: Level,
    pub gateway: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl LogLine {
    pub fn info(gateway: &str, content: &str) -> Self {
        Self { ts: Utc::now(), level: Level::Info, gateway: gateway.into(), content: content.into(), code: None }
    }
    pub fn error(gateway: &str, content: &str, code: i64) -> Self {
        Self { ts: Utc::now(), level: Level::Error, gateway: gateway.into(), content: content.into(), code: Some(code) }
    }
}

/// Durable side channel for gateway log/error lines.
pub trait LogSink: Send + Sync {
    fn append(&self, line: &LogLine) -> Result<(), SinkError>;
}

/// Handle to the JSONL writer task.
#[derive(Debug, Clone)]
pub struct JsonlRecorder {
    tx: mpsc::Sender<String>,
}

impl JsonlRecorder {
    /// Spawns the writer task. Must be called inside a tokio runtime.
    /// The task ends (after a final flush) once every handle is dropped.
    pub fn spawn(path: impl Into<String>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<String>(capacity.max(1));
        let handle = tokio::spawn(run(rx, path.into()));
        (Self { tx }, handle)
    }
}

impl LogSink for JsonlRecorder {
    fn append(&self, line: &LogLine) -> Result<(), SinkError> {
        let s = serde_json::to_string(line).map_err(|e| SinkError::Serialize(e.to_string()))?;
        self.tx.try_send(s).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<tokio::fs::File>> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<tokio::fs::File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<String>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            // rx dropped here: every later append sees SinkError::Closed
            error!(?e, %path, "recorder: open failed, durable log disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_LINES: u32 = 1000;

    loop {
        tokio::select! {
            maybe_line = rx.recv() => {
                match maybe_line {
                    Some(line) => {
                        if let Err(e) = write_line(&mut writer, &line).await {
                            error!(?e, "recorder: write failed, attempting reopen");
                            match open_writer(&path).await {
                                Ok(w) => writer = w,
                                Err(e2) => {
                                    error!(?e2, "recorder: reopen failed, drop line");
                                    continue;
                                }
                            }
                            if let Err(e2) = write_line(&mut writer, &line).await {
                                error!(?e2, "recorder: write failed again after reopen, drop line");
                                continue;
                            }
                        }

                        since_last_flush += 1;
                        if since_last_flush >= FLUSH_EVERY_N_LINES {
                            let _ = writer.flush().await;
                            since_last_flush = 0;
                        }
                    }
                    None => {
                        let _ = writer.flush().await;
                        info!("recorder: channel closed, stopped");
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_jsonl_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/gw.jsonl");
        let (rec, handle) = JsonlRecorder::spawn(path.to_string_lossy().to_string(), 16);
        rec.append(&LogLine::info("GW", "connected")).unwrap();
        rec.append(&LogLine::error("GW", "timeout", 1002)).unwrap();
        drop(rec);
        handle.await.unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["level"], "Info");
        assert_eq!(first["content"], "connected");
        assert!(first.get("code").is_none());
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["code"], 1002);
    }

    #[tokio::test]
    async fn closed_sink_reports_error() {
        let (tx, rx) = mpsc::channel::<String>(1);
        drop(rx);
        let rec = JsonlRecorder { tx };
        assert_eq!(rec.append(&LogLine::info("GW", "x")), Err(SinkError::Closed));
    }
}
