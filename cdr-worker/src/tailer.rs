use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use cdr_common::checkpoint::Checkpoint;
use cdr_common::record::{self, DecodeError, Event, RECORD_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::{info, warn};

use crate::error::WorkerError;
use crate::worker::DeliveryWorker;

/// Records are read in chunks of this many at a time.
const RECORDS_PER_READ: usize = 2048;

/// Reads a day's source file record by record, persisting the checkpoint before handing each
/// decoded event to the `DeliveryWorker`.
pub struct Tailer<'w> {
    worker: &'w DeliveryWorker,
    checkpoint_path: &'w Path,
}

impl<'w> Tailer<'w> {
    pub fn new(worker: &'w DeliveryWorker, checkpoint_path: &'w Path) -> Self {
        Self {
            worker,
            checkpoint_path,
        }
    }

    /// Read `path` from `checkpoint.record_index` to its end, returning the final record index.
    ///
    /// `checkpoint` only advances once the new index has been saved, so on error it still
    /// matches what is on disk. A trailing partial record fails the pass without advancing.
    /// A pass reading nothing still saves `checkpoint`, which persists a rollover into a day with
    /// no records yet.
    pub async fn process_pass(
        &self,
        checkpoint: &mut Checkpoint,
        path: &Path,
    ) -> Result<u64, WorkerError> {
        let read_error = |error| WorkerError::ReadError {
            path: path.to_owned(),
            error,
        };

        let mut file = tokio::fs::File::open(path).await.map_err(read_error)?;
        file.seek(SeekFrom::Start(checkpoint.record_index * RECORD_LEN as u64))
            .await
            .map_err(read_error)?;
        let mut reader = BufReader::with_capacity(RECORDS_PER_READ * RECORD_LEN, file);
        let start_index = checkpoint.record_index;

        let mut block = [0u8; RECORD_LEN];
        loop {
            match read_block(&mut reader, &mut block)
                .await
                .map_err(read_error)?
            {
                0 => break,
                RECORD_LEN => {}
                partial => {
                    return Err(format_error(
                        path,
                        checkpoint.record_index,
                        DecodeError::InvalidLength(partial),
                    ))
                }
            }

            let event = record::decode(&block)
                .map_err(|error| format_error(path, checkpoint.record_index, error))?;

            let next = Checkpoint::new(checkpoint.billing_date, checkpoint.record_index + 1);
            log_event(&event, &next);
            next.save(self.checkpoint_path).await?;
            *checkpoint = next;

            self.worker.submit(event).await;
        }

        if checkpoint.record_index == start_index {
            checkpoint.save(self.checkpoint_path).await?;
        }

        Ok(checkpoint.record_index)
    }
}

fn format_error(path: &Path, index: u64, error: DecodeError) -> WorkerError {
    WorkerError::FormatError {
        path: PathBuf::from(path),
        index,
        error,
    }
}

/// Fill `block` from `reader`, returning how many bytes were read. Anything short of the full
/// block means the end of the file was reached.
async fn read_block<R: AsyncRead + Unpin>(
    reader: &mut R,
    block: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;

    while filled < block.len() {
        match reader.read(&mut block[filled..]).await? {
            0 => break,
            read => filled += read,
        }
    }

    Ok(filled)
}

fn log_event(event: &Event, checkpoint: &Checkpoint) {
    metrics::counter!("cdr_records_decoded_total").increment(1);

    if !event.is_checksum_valid {
        metrics::counter!("cdr_checksum_mismatch_total").increment(1);
        warn!(
            billing_date = %checkpoint.billing_date,
            record_index = checkpoint.record_index,
            "record checksum does not match"
        );
    }

    info!(
        billing_date = %checkpoint.billing_date,
        record_index = checkpoint.record_index,
        fee = event.fee,
        is_payable = event.is_payable,
        is_checksum_valid = event.is_checksum_valid,
        call_type = event.call_type,
        business_type = event.business_type,
        from_phone = %event.from_phone,
        to_phone = %event.to_phone,
        to_phone_type = event.to_phone_type,
        begin_time = %event.begin_time,
        end_time = %event.end_time,
        duration_seconds = event.duration_seconds,
        "decoded record"
    );
}
