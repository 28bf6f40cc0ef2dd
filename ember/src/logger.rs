//! Rotating file logger behind the `log` facade.
//!
//! Lines are fully formatted by the producing thread, then either written in
//! place (synchronous mode) or handed to a single writer thread through a
//! bounded [`BlockQueue`] (asynchronous mode, queue capacity > 0). Files
//! rotate on local-day change and every `MAX_LINES` lines.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{Datelike, Local};
use log::{Level, LevelFilter, Metadata, Record};

use crate::blockqueue::BlockQueue;

const MAX_LINES: u64 = 50_000;

struct LogInner {
    file: Option<File>,
    dir: PathBuf,
    suffix: String,
    line_count: u64,
    today: u32,
    max_lines: u64,
}

impl LogInner {
    fn write_line(&mut self, line: &str) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.write_all(line.as_bytes());
        }
    }

    fn flush_file(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}

pub struct Logger {
    inner: Arc<Mutex<LogInner>>,
    queue: Option<Arc<BlockQueue<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    level: AtomicUsize,
    open: AtomicBool,
}

fn level_filter(level: usize) -> LevelFilter {
    match level {
        0 => LevelFilter::Debug,
        1 => LevelFilter::Info,
        2 => LevelFilter::Warn,
        _ => LevelFilter::Error,
    }
}

fn level_title(level: Level) -> &'static str {
    match level {
        Level::Trace | Level::Debug => "[debug]: ",
        Level::Info => "[info] : ",
        Level::Warn => "[warn] : ",
        Level::Error => "[error]: ",
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Logger {
    /// Opens today's log file under `dir` (created if missing) and, for a
    /// positive `queue_capacity`, starts the writer thread.
    pub fn init(
        level: usize,
        dir: &Path,
        suffix: &str,
        queue_capacity: i64,
    ) -> io::Result<Arc<Logger>> {
        Self::init_with(level, dir, suffix, queue_capacity, MAX_LINES)
    }

    pub(crate) fn init_with(
        level: usize,
        dir: &Path,
        suffix: &str,
        queue_capacity: i64,
        max_lines: u64,
    ) -> io::Result<Arc<Logger>> {
        fs::create_dir_all(dir)?;
        let now = Local::now();
        let file_name = dir.join(format!("{}{}", now.format("%Y_%m_%d"), suffix));
        let file = open_log_file(&file_name)?;

        let inner = Arc::new(Mutex::new(LogInner {
            file: Some(file),
            dir: dir.to_path_buf(),
            suffix: suffix.to_string(),
            line_count: 0,
            today: now.day(),
            max_lines,
        }));

        let mut queue = None;
        let mut writer = None;
        if queue_capacity > 0 {
            let q = Arc::new(BlockQueue::<String>::new(queue_capacity as usize));
            let drain_queue = q.clone();
            let drain_inner = inner.clone();
            writer = Some(
                thread::Builder::new()
                    .name("ember-log".to_string())
                    .spawn(move || {
                        while let Some(line) = drain_queue.pop() {
                            let mut inner = drain_inner.lock().unwrap();
                            inner.write_line(&line);
                        }
                        drain_inner.lock().unwrap().flush_file();
                    })?,
            );
            queue = Some(q);
        }

        Ok(Arc::new(Logger {
            inner,
            queue,
            writer: Mutex::new(writer),
            level: AtomicUsize::new(level),
            open: AtomicBool::new(true),
        }))
    }

    /// Installs this logger as the `log` crate backend.
    pub fn install(self: &Arc<Self>) {
        let _ = log::set_boxed_logger(Box::new(Facade(self.clone())));
        log::set_max_level(level_filter(self.level.load(Ordering::Relaxed)));
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    pub fn level(&self) -> usize {
        self.level.load(Ordering::Relaxed)
    }

    pub fn set_level(&self, level: usize) {
        self.level.store(level, Ordering::Relaxed);
        log::set_max_level(level_filter(level));
    }

    /// Formats and records one line. Rotation is checked before assembly so
    /// the line lands in the file it is counted against.
    pub fn write(&self, level: Level, args: fmt::Arguments<'_>) {
        if !self.is_open() {
            return;
        }
        let now = Local::now();
        let mut inner = self.inner.lock().unwrap();

        let day_changed = inner.today != now.day();
        if day_changed || (inner.line_count > 0 && inner.line_count % inner.max_lines == 0) {
            let tail = now.format("%Y_%m_%d").to_string();
            let new_file = if day_changed {
                inner.today = now.day();
                inner.line_count = 0;
                inner.dir.join(format!("{}{}", tail, inner.suffix))
            } else {
                let seq = inner.line_count / inner.max_lines;
                inner.dir.join(format!("{}-{}{}", tail, seq, inner.suffix))
            };
            inner.flush_file();
            match open_log_file(&new_file) {
                Ok(f) => inner.file = Some(f),
                Err(_) => inner.file = None,
            }
        }

        inner.line_count += 1;
        let line = format!(
            "{} {}{}\n",
            now.format("%Y-%m-%d %H:%M:%S%.6f"),
            level_title(level),
            args
        );

        match &self.queue {
            Some(queue) => {
                drop(inner);
                queue.push_back(line);
                queue.flush();
            }
            None => inner.write_line(&line),
        }
    }

    /// Nudges the writer and flushes the current file.
    pub fn flush(&self) {
        if let Some(queue) = &self.queue {
            queue.flush();
        }
        self.inner.lock().unwrap().flush_file();
    }

    /// Drains the queue, stops the writer and closes the file. Idempotent.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(queue) = &self.queue {
            while !queue.is_empty() {
                queue.flush();
                thread::yield_now();
            }
            queue.close();
        }
        if let Some(handle) = self.writer.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut inner = self.inner.lock().unwrap();
        inner.flush_file();
        inner.file = None;
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.close();
    }
}

struct Facade(Arc<Logger>);

impl log::Log for Facade {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        self.0.is_open()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            self.0.write(record.level(), *record.args());
        }
    }

    fn flush(&self) {
        self.0.flush();
    }
}
