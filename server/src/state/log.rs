//! Diagnostic log sink.
//!
//! The tick and ingress paths are hot; log lines go through an unbounded
//! channel to a dedicated writer thread, and nothing is even formatted when
//! no log file is configured. The writer reopens the file whenever the
//! configured path changes.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

use crate::config::SyncVars;
use crate::time;

pub struct SyncLogger {
    vars: Arc<SyncVars>,
    tx: Option<Sender<String>>,
    writer: Option<JoinHandle<()>>,
}

impl SyncLogger {
    pub fn new(vars: Arc<SyncVars>) -> Self {
        let (tx, rx) = unbounded::<String>();

        let writer_vars = vars.clone();
        let writer = std::thread::Builder::new()
            .name("sync-log".into())
            .spawn(move || {
                let mut last_path = String::new();
                let mut file: Option<BufWriter<File>> = None;

                while let Ok(line) = rx.recv() {
                    let path = writer_vars.log_file();

                    if path != last_path {
                        file = if path.is_empty() {
                            None
                        } else {
                            match File::create(&path) {
                                Ok(f) => Some(BufWriter::new(f)),
                                Err(err) => {
                                    log::warn!("could not open sync log {path}: {err}");
                                    None
                                }
                            }
                        };
                        last_path = path;
                    }

                    if let Some(file) = &mut file {
                        let _ = file.write_all(line.as_bytes());
                        let _ = file.flush();
                    }
                }
            })
            .expect("failed to spawn sync log writer");

        Self {
            vars,
            tx: Some(tx),
            writer: Some(writer),
        }
    }

    /// Cheap gate for call sites; skip formatting entirely when disabled.
    pub fn enabled(&self) -> bool {
        self.vars.log_enabled()
    }

    pub fn write(&self, line: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(format!("[{:>10}] {line}\n", time::msec()));
        }
    }
}

impl Drop for SyncLogger {
    fn drop(&mut self) {
        self.tx.take();

        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

/// Diagnostic logging with the formatting cost gated on configuration.
macro_rules! gs_log {
    ($logger:expr, $($arg:tt)*) => {
        if $logger.enabled() {
            $logger.write(format!($($arg)*));
        }
    };
}

pub(crate) use gs_log;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_logger_reports_disabled() {
        let vars = Arc::new(SyncVars::default());
        let logger = SyncLogger::new(vars.clone());

        assert!(!logger.enabled());

        vars.set_log_file("/tmp/some-sync.log");
        assert!(logger.enabled());

        vars.set_log_file("");
        assert!(!logger.enabled());
    }

    #[test]
    fn lines_reach_the_configured_file() {
        let dir = std::env::temp_dir().join("gamestate-log-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sync.log");
        let _ = std::fs::remove_file(&path);

        let vars = Arc::new(SyncVars::default());
        vars.set_log_file(path.to_str().unwrap());

        {
            let logger = SyncLogger::new(vars.clone());
            gs_log!(logger, "hello {}", 42);
            // drop joins the writer, flushing the line
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello 42"));
    }
}
