//! # Checkpoint
//!
//! The read position in the day's source file, persisted as a single `YYYYMMDD|index` line.
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveDate;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

const DATE_FORMAT: &str = "%Y%m%d";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("failed to access checkpoint file {path}: {error}")]
    IoError {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("{0:?} is not a valid checkpoint line")]
    ParseError(String),
}

/// Billing date of the file being read and the number of records already read from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub billing_date: NaiveDate,
    pub record_index: u64,
}

impl Checkpoint {
    pub fn new(billing_date: NaiveDate, record_index: u64) -> Self {
        Self {
            billing_date,
            record_index,
        }
    }

    /// Read a checkpoint from `path`. A missing file is an error: there is no sensible default
    /// billing date to start from.
    pub async fn load(path: &Path) -> Result<Self, CheckpointError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|error| CheckpointError::IoError {
                    path: path.to_owned(),
                    error,
                })?;

        contents.parse()
    }

    /// Overwrite `path` with this checkpoint, returning once the data has reached the disk.
    pub async fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let io_error = |error| CheckpointError::IoError {
            path: path.to_owned(),
            error,
        };

        let mut file = tokio::fs::File::create(path).await.map_err(io_error)?;
        file.write_all(self.to_string().as_bytes())
            .await
            .map_err(io_error)?;
        file.sync_data().await.map_err(io_error)
    }

    /// Path of the source file for this checkpoint's billing date.
    pub fn source_path(&self, base_path: &str) -> PathBuf {
        PathBuf::from(format!(
            "{}{}.bil",
            base_path,
            self.billing_date.format(DATE_FORMAT)
        ))
    }

    /// Move to the next billing date if `today` is past the current one.
    ///
    /// Only a single day is ever advanced, no matter how far behind the checkpoint is.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if today <= self.billing_date {
            return false;
        }

        match self.billing_date.succ_opt() {
            Some(next) => {
                self.billing_date = next;
                self.record_index = 0;
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}|{}",
            self.billing_date.format(DATE_FORMAT),
            self.record_index
        )
    }
}

impl FromStr for Checkpoint {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_error = || CheckpointError::ParseError(s.to_owned());

        let (date, index) = s.trim().split_once('|').ok_or_else(parse_error)?;
        let billing_date =
            NaiveDate::parse_from_str(date, DATE_FORMAT).map_err(|_| parse_error())?;
        let record_index = index.parse::<u64>().map_err(|_| parse_error())?;

        Ok(Checkpoint::new(billing_date, record_index))
    }
}
