//! Shared pool of append-only file writers.
//!
//! Sink filters may be configured to write to the same path. The pool hands
//! out reference-counted accessors keyed by path: the first accessor opens
//! the file and writes the caller-supplied header if the file is empty;
//! later accessors inherit the same handle. Closing the last accessor
//! closes the file. Writes are serialized by a per-file mutex and flushed.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::EngineError;
use crate::telemetry::{noop_event_listener, EngineEvent, EngineEventListener};

struct ActiveWriter {
    file: Mutex<File>,
    references: Mutex<usize>,
}

#[derive(Clone)]
pub struct FileWritersPool {
    writers: Arc<Mutex<HashMap<PathBuf, Arc<ActiveWriter>>>>,
    events: Arc<dyn EngineEventListener>,
}

impl FileWritersPool {
    pub fn new() -> Self {
        Self::with_events(noop_event_listener())
    }

    pub fn with_events(events: Arc<dyn EngineEventListener>) -> Self {
        FileWritersPool {
            writers: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Opens an accessor for `path`. Opening flags and the header only take
    /// effect for the first accessor of a given path; subsequent accessors
    /// share the already-open handle.
    pub fn open(
        &self,
        path: impl AsRef<Path>,
        append: bool,
        header: &[u8],
    ) -> Result<FileAccessor, EngineError> {
        let path = path.as_ref().to_path_buf();

        let writer = {
            let mut writers = self.writers.lock()?;

            let writer = match writers.get(&path) {
                Some(writer) => Arc::clone(writer),
                None => {
                    self.events.on_event(EngineEvent::FileOpened { path: path.clone() });

                    let file = OpenOptions::new()
                        .create(true)
                        .append(append)
                        .write(true)
                        .truncate(!append)
                        .open(&path)?;

                    let writer = Arc::new(ActiveWriter {
                        file: Mutex::new(file),
                        references: Mutex::new(0),
                    });
                    writers.insert(path.clone(), Arc::clone(&writer));
                    writer
                }
            };

            // The count changes under the pool lock, so a closing accessor
            // cannot race a concurrent open of the same path.
            *writer.references.lock()? += 1;
            writer
        };

        {
            let mut file = writer.file.lock()?;
            if file.metadata()?.len() == 0 && !header.is_empty() {
                // Only the first accessor of an empty file writes the header.
                file.write_all(header)?;
                file.flush()?;
            }
        }

        Ok(FileAccessor {
            pool: Arc::clone(&self.writers),
            events: Arc::clone(&self.events),
            path,
            writer,
        })
    }
}

impl Default for FileWritersPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Reference-counted handle onto a pooled file.
pub struct FileAccessor {
    pool: Arc<Mutex<HashMap<PathBuf, Arc<ActiveWriter>>>>,
    events: Arc<dyn EngineEventListener>,
    path: PathBuf,
    writer: Arc<ActiveWriter>,
}

impl FileAccessor {
    /// Appends and flushes, serialized against other accessors of the same
    /// file.
    pub fn write(&self, data: &[u8]) -> Result<(), EngineError> {
        let mut file = self.writer.file.lock()?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileAccessor {
    fn drop(&mut self) {
        if let Ok(mut writers) = self.pool.lock() {
            let last = match self.writer.references.lock() {
                Ok(mut references) => {
                    *references -= 1;
                    *references == 0
                }
                Err(_) => false,
            };

            if last {
                writers.remove(&self.path);
                self.events.on_event(EngineEvent::FileClosed {
                    path: self.path.clone(),
                });
            }
        }
    }
}
