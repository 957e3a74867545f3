use bytes::Bytes;
use log::{debug, error};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Mutex;
use tokio::{
    fs::File,
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::error::ApplicationError;

struct Write {
    offset: u64,
    data:   Bytes,
}

/// Output file fed by a background writer task.
///
/// `write` only enqueues, so callers never wait on the disk. The first I/O
/// failure stops the writer and is published on [`StorageSink::faults`].
pub struct StorageSink {
    tx:     Mutex<Option<mpsc::UnboundedSender<Write>>>,
    worker: Mutex<Option<JoinHandle<Result<u64, ApplicationError>>>>,
    fault:  watch::Receiver<Option<String>>,
}

impl StorageSink {
    /// Creates (or truncates) the output file and starts the writer task.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ApplicationError> {
        let file = File::create(path.as_ref()).await.map_err(|e| {
            ApplicationError::StorageError(format!("{}: {}", path.as_ref().display(), e))
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (fault_tx, fault) = watch::channel(None);
        let worker = tokio::spawn(write_loop(file, rx, fault_tx));

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            fault,
        })
    }

    /// Queues `data` for writing at `offset`.
    pub fn write(&self, offset: u64, data: impl Into<Bytes>) -> Result<(), ApplicationError> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        tx.as_ref()
            .ok_or_else(|| ApplicationError::StorageError("sink is closed".into()))?
            .send(Write {
                offset,
                data: data.into(),
            })
            .map_err(|_| ApplicationError::StorageError("writer has stopped".into()))
    }

    /// Watch channel that turns `Some(reason)` once a write has failed.
    pub fn faults(&self) -> watch::Receiver<Option<String>> {
        self.fault.clone()
    }

    /// Drains pending writes and flushes the file. Returns the number of
    /// bytes written. Closing twice is a no-op.
    pub async fn close(&self) -> Result<u64, ApplicationError> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        match worker {
            Some(worker) => worker
                .await
                .map_err(|e| ApplicationError::StorageError(format!("writer task: {}", e)))?,
            None => Ok(0),
        }
    }
}

async fn write_loop(
    mut file: File,
    mut rx:   mpsc::UnboundedReceiver<Write>,
    fault:    watch::Sender<Option<String>>,
) -> Result<u64, ApplicationError> {
    let mut written = 0u64;
    while let Some(write) = rx.recv().await {
        let result = async {
            file.seek(SeekFrom::Start(write.offset)).await?;
            file.write_all(&write.data).await?;
            // tokio's File reports a failed write only on the next operation
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            error!("write of {} bytes at offset {} failed: {}", write.data.len(), write.offset, e);
            fault.send_replace(Some(e.to_string()));
            return Err(ApplicationError::StorageError(e.to_string()));
        }
        written += write.data.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    debug!("storage closed after {} bytes", written);
    Ok(written)
}
