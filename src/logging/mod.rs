//! Gateway log pipeline.
//!
//! env_logger renders each record, including its key-value pairs (the
//! access log attaches the request correlation id this way), into a
//! bounded channel; a background service drains the channel into the
//! configured file in batches. The request path never blocks on disk:
//! when the queue is full the line is dropped and the drop is counted
//! into the file on the next write.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use env_logger::Builder;
use log::LevelFilter;
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::{
    fs::{create_dir_all, metadata, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{channel, Receiver, Sender},
};

use crate::config;

const LOG_QUEUE_DEPTH: usize = 4096;

/// `Write` end of the log channel, handed to env_logger. Lossy on
/// overflow rather than blocking the logging thread.
struct LogPipe {
    sender: Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

impl Write for LogPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.sender.try_send(buf.to_vec()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct KvAppender<'a, W: io::Write>(&'a mut W);

impl<'a, 'kv, W: io::Write> log::kv::VisitSource<'kv> for KvAppender<'a, W> {
    fn visit_pair(
        &mut self,
        key: log::kv::Key<'kv>,
        value: log::kv::Value<'kv>,
    ) -> Result<(), log::kv::Error> {
        write!(self.0, " {key}={value}").map_err(|_| log::kv::Error::msg("log write failed"))
    }
}

pub struct Logger {
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
    dropped: Arc<AtomicU64>,
    config: config::Log,
}

impl Logger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = channel::<Vec<u8>>(LOG_QUEUE_DEPTH);
        Self {
            sender,
            receiver,
            dropped: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    pub fn init_env_logger(&self) {
        let writer = LogPipe {
            sender: self.sender.clone(),
            dropped: self.dropped.clone(),
        };
        Builder::from_env(env_logger::Env::default())
            .filter(None, LevelFilter::Info)
            .format(|buf, record| {
                write!(
                    buf,
                    "[{} {} {}]",
                    buf.timestamp_millis(),
                    record.level(),
                    record.target()
                )?;
                let _ = record.key_values().visit(&mut KvAppender(buf));
                writeln!(buf, " {}", record.args())
            })
            .target(env_logger::Target::Pipe(Box::new(writer)))
            .init();
    }
}

#[async_trait]
impl Service for Logger {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let log_file_path = &self.config.path;

        if let Some(parent) = std::path::Path::new(log_file_path).parent() {
            if metadata(parent).await.is_err() {
                create_dir_all(parent)
                    .await
                    .expect("Failed to create log path")
            }
        }

        let mut file = BufWriter::new(
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_file_path)
                .await
                .expect("Failed to open or create log file"),
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                },

                line = self.receiver.recv() => {
                    let Some(line) = line else { break };
                    // one line woke us; take whatever else queued up and
                    // flush the whole batch in one pass
                    let mut batch = line;
                    while let Ok(more) = self.receiver.try_recv() {
                        batch.extend_from_slice(&more);
                    }
                    let lost = self.dropped.swap(0, Ordering::Relaxed);
                    if lost > 0 {
                        batch.extend_from_slice(
                            format!("[log] {lost} lines dropped, queue full\n").as_bytes(),
                        );
                    }
                    if let Err(e) = file.write_all(&batch).await {
                        eprintln!("Failed to write to log file: {e}");
                    }
                    if let Err(e) = file.flush().await {
                        eprintln!("Failed to flush log file: {e}");
                    }
                }
            }
        }

        if let Err(e) = file.flush().await {
            eprintln!("Failed to flush log file: {e}");
        }
    }

    fn name(&self) -> &'static str {
        "log writer"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_drops_and_counts() {
        let (sender, _receiver) = channel::<Vec<u8>>(2);
        let dropped = Arc::new(AtomicU64::new(0));
        let mut pipe = LogPipe {
            sender,
            dropped: dropped.clone(),
        };

        for _ in 0..5 {
            // a full queue still reports the whole buffer as written
            assert_eq!(pipe.write(b"line\n").unwrap(), 5);
        }
        assert_eq!(dropped.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_kv_appender_renders_pairs() {
        let mut out = Vec::new();
        let source: &[(&str, i64)] = &[("status", 200), ("attempt", 2)];
        log::kv::Source::visit(&source, &mut KvAppender(&mut out)).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), " status=200 attempt=2");
    }

    #[tokio::test]
    async fn test_service_writes_queued_lines_until_shutdown() {
        let path = std::env::temp_dir().join(format!("metagate-log-{}", uuid::Uuid::new_v4()));
        let mut logger = Logger::new(config::Log {
            path: path.to_string_lossy().into_owned(),
        });
        logger.sender.send(b"first line\n".to_vec()).await.unwrap();
        logger.sender.send(b"second line\n".to_vec()).await.unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let writer = async { logger.start_service(None, shutdown_rx).await };
        let stopper = async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            shutdown_tx.send(true).unwrap();
        };
        tokio::join!(writer, stopper);

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(written.contains("first line"));
        assert!(written.contains("second line"));
        let _ = tokio::fs::remove_file(&path).await;
    }
}
