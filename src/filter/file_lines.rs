//! File source: one message per line of a text file.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use crate::error::EngineError;
use crate::filter::source::{Fetch, FetchStatus, SourceFilter};
use crate::manager::TimeSeriesManager;
use crate::types::Message;

pub struct FileLinesFetcher {
    path: PathBuf,
    metadata: String,
    reader: Option<BufReader<File>>,
}

impl Fetch for FileLinesFetcher {
    fn fetch(&mut self, message: &mut Message) -> Result<FetchStatus, EngineError> {
        let reader = match &mut self.reader {
            Some(reader) => reader,
            None => return Ok(FetchStatus::Done),
        };

        let mut line = String::new();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            return Ok(FetchStatus::Done);
        }

        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }

        message.set_metadata(self.metadata.clone());
        message.set_value(line.into_bytes());
        Ok(FetchStatus::Success)
    }

    fn on_start(&mut self) -> Result<(), EngineError> {
        self.reader = Some(BufReader::new(File::open(&self.path)?));
        Ok(())
    }

    fn on_stop(&mut self) -> Result<(), EngineError> {
        self.reader = None;
        Ok(())
    }
}

/// A source filter feeding the lines of a file into a series.
pub type FileLinesFilter = SourceFilter<FileLinesFetcher>;

pub fn file_lines_filter(
    name: impl Into<String>,
    manager: &TimeSeriesManager,
    output: impl Into<String>,
    path: impl Into<PathBuf>,
) -> Result<FileLinesFilter, EngineError> {
    SourceFilter::new(
        name,
        manager,
        output,
        FileLinesFetcher {
            path: path.into(),
            metadata: String::new(),
            reader: None,
        },
    )
}

impl FileLinesFilter {
    pub fn set_metadata(&mut self, metadata: impl Into<String>) {
        self.fetcher_mut().metadata = metadata.into();
    }
}
