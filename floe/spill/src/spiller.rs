// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! [`SingleStreamSpiller`]: one overflow episode's worth of pages,
//! appended to a single temp file and read back as a lazy stream.

use std::collections::VecDeque;
use std::fs::File;
use std::future::Future;
use std::io::{BufReader, BufWriter, Write};
use std::mem;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use futures::Stream;
use log::{debug, warn};
use parking_lot::Mutex;
use tempfile::{Builder, NamedTempFile};
use tokio::task::JoinHandle;

use floe_common::{FloeError, Result};
use floe_execution::memory_pool::LocalMemoryContext;

use crate::serde::PageSerde;

/// Reserved in the memory context at construction: the cost of the open
/// file handle plus the write buffer, held even if no page is ever
/// spilled.
pub const WRITE_BUFFER_SIZE: usize = 4 * 1024;

/// Reserved in addition once read-back begins, released when the read
/// stream is exhausted, dropped, or the spiller is closed.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Invoked after each successful spill call with the bytes that call
/// committed to disk. Callers use it to track on-disk footprint, e.g.
/// by forwarding to `QueryContext::reserve_spill`.
pub type SpillCommittedBytesCallback = Box<dyn Fn(u64) + Send + Sync>;

/// Spills an ordered sequence of pages of one schema to a single file,
/// then hands them back in order through [`Self::spilled_pages`].
///
/// Lifecycle: zero or more `spill` calls, at most one read pass, then
/// [`Self::close`]. Concurrent `spill` calls are not supported;
/// serialize externally. Close is idempotent and safe after any
/// failure; dropping the spiller closes it.
pub struct SingleStreamSpiller {
    schema: SchemaRef,
    serde: Arc<PageSerde>,
    shared: Arc<SpillerShared>,
    prefetch_pages: usize,
    direct_serde: bool,
    committed_bytes_callback: SpillCommittedBytesCallback,
}

impl SingleStreamSpiller {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        schema: SchemaRef,
        serde: Arc<PageSerde>,
        directory: PathBuf,
        directory_usage: Arc<AtomicU64>,
        prefetch_pages: usize,
        direct_serde: bool,
        committed_bytes_callback: SpillCommittedBytesCallback,
        memory_context: LocalMemoryContext,
    ) -> Result<Self> {
        let shared = Arc::new(SpillerShared {
            memory_context,
            file: Mutex::new(FileState::Unopened { directory }),
            directory_usage,
            committed_bytes: AtomicU64::new(0),
            reservations: Mutex::new(ReservationState::default()),
        });
        shared.reserve_write_buffer()?;
        Ok(Self {
            schema,
            serde,
            shared,
            prefetch_pages,
            direct_serde,
            committed_bytes_callback,
        })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Bytes committed to the backing file so far.
    pub fn committed_bytes(&self) -> u64 {
        self.shared.committed_bytes.load(Ordering::Acquire)
    }

    /// Append one page. Completes when the page is durably framed into
    /// the backing file.
    pub async fn spill(&self, page: RecordBatch) -> Result<()> {
        self.spill_pages(vec![page]).await
    }

    /// Append `pages` in order. Multiple calls append to the same file
    /// in call order.
    pub async fn spill_pages(&self, pages: Vec<RecordBatch>) -> Result<()> {
        if self.shared.reservations.lock().closed {
            return Err(FloeError::Internal(
                "cannot spill through a closed spiller".to_string(),
            ));
        }
        let shared = Arc::clone(&self.shared);
        let serde = Arc::clone(&self.serde);
        let direct = self.direct_serde;
        let written = tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut guard = shared.file.lock();
            let file = guard.open_or_create()?;
            let mut writer = BufWriter::new(file.as_file_mut());
            let mut written = 0u64;
            for page in &pages {
                written += serde.write_page(&mut writer, page, direct)?;
            }
            writer.flush()?;
            Ok(written)
        })
        .await
        .map_err(|e| FloeError::Internal(format!("spill writer task failed: {e}")))??;

        self.shared
            .committed_bytes
            .fetch_add(written, Ordering::AcqRel);
        self.shared
            .directory_usage
            .fetch_add(written, Ordering::AcqRel);
        (self.committed_bytes_callback)(written);
        Ok(())
    }

    /// Open the single read pass over everything spilled so far. The
    /// stream is lazy, forward-only and not restartable; its first poll
    /// reserves the read buffer in the memory context.
    pub fn spilled_pages(&self) -> Result<SpilledPageStream> {
        {
            let mut reservations = self.shared.reservations.lock();
            if reservations.closed {
                return Err(FloeError::Internal(
                    "cannot read from a closed spiller".to_string(),
                ));
            }
            if reservations.read_started {
                return Err(FloeError::Internal(
                    "spilled pages can only be read once".to_string(),
                ));
            }
            reservations.read_started = true;
        }
        Ok(SpilledPageStream {
            schema: Arc::clone(&self.schema),
            serde: Arc::clone(&self.serde),
            shared: Arc::clone(&self.shared),
            prefetch_pages: self.prefetch_pages,
            buffered: VecDeque::new(),
            state: ReadState::Uninitialized,
        })
    }

    /// Delete the backing file and release every memory reservation.
    /// Idempotent; never propagates cleanup failures.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for SingleStreamSpiller {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for SingleStreamSpiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleStreamSpiller")
            .field("schema", &self.schema)
            .field("committed_bytes", &self.committed_bytes())
            .finish()
    }
}

#[derive(Debug, Default)]
struct ReservationState {
    write_reserved: bool,
    read_reserved: bool,
    read_started: bool,
    closed: bool,
}

/// The backing file is created lazily on the first spill, so a spiller
/// that never received a page leaves nothing on disk.
enum FileState {
    Unopened { directory: PathBuf },
    Open(NamedTempFile),
    Closed,
}

impl FileState {
    fn open_or_create(&mut self) -> Result<&mut NamedTempFile> {
        if let FileState::Unopened { directory } = self {
            let file = Builder::new()
                .prefix("spill")
                .suffix(".bin")
                .tempfile_in(directory.as_path())
                .map_err(FloeError::IoError)?;
            debug!("created spill file {:?}", file.path());
            *self = FileState::Open(file);
        }
        match self {
            FileState::Open(file) => Ok(file),
            FileState::Closed => Err(FloeError::Internal(
                "cannot spill through a closed spiller".to_string(),
            )),
            FileState::Unopened { .. } => unreachable!(),
        }
    }
}

struct SpillerShared {
    memory_context: LocalMemoryContext,
    file: Mutex<FileState>,
    /// The factory's usage ledger for the directory holding our file
    directory_usage: Arc<AtomicU64>,
    committed_bytes: AtomicU64,
    reservations: Mutex<ReservationState>,
}

impl SpillerShared {
    /// Bring the memory context in line with the reservation flags. The
    /// admission future is intentionally dropped: buffer reservations
    /// take effect immediately and are not subject to backpressure.
    fn sync_memory_reservation(&self) -> Result<()> {
        let (write_reserved, read_reserved) = {
            let reservations = self.reservations.lock();
            (reservations.write_reserved, reservations.read_reserved)
        };
        let mut total = 0i64;
        if write_reserved {
            total += WRITE_BUFFER_SIZE as i64;
        }
        if read_reserved {
            total += READ_BUFFER_SIZE as i64;
        }
        self.memory_context.set_bytes(total).map(|_| ())
    }

    fn reserve_write_buffer(&self) -> Result<()> {
        self.reservations.lock().write_reserved = true;
        if let Err(e) = self.sync_memory_reservation() {
            self.reservations.lock().write_reserved = false;
            return Err(e);
        }
        Ok(())
    }

    fn reserve_read_buffer(&self) -> Result<()> {
        {
            let mut reservations = self.reservations.lock();
            if reservations.closed {
                return Err(FloeError::Internal(
                    "cannot read from a closed spiller".to_string(),
                ));
            }
            if reservations.read_reserved {
                return Ok(());
            }
            reservations.read_reserved = true;
        }
        if let Err(e) = self.sync_memory_reservation() {
            self.reservations.lock().read_reserved = false;
            return Err(e);
        }
        Ok(())
    }

    fn release_read_buffer(&self) {
        {
            let mut reservations = self.reservations.lock();
            if reservations.closed || !reservations.read_reserved {
                return;
            }
            reservations.read_reserved = false;
        }
        if let Err(e) = self.sync_memory_reservation() {
            warn!("failed to release spill read-buffer reservation: {e}");
        }
    }

    fn close(&self) {
        {
            let mut reservations = self.reservations.lock();
            if reservations.closed {
                return;
            }
            reservations.closed = true;
            reservations.write_reserved = false;
            reservations.read_reserved = false;
        }
        if let Err(e) = self.memory_context.set_bytes(0) {
            warn!("failed to release spiller memory reservations: {e}");
        }
        let file = mem::replace(&mut *self.file.lock(), FileState::Closed);
        if let FileState::Open(file) = file {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                warn!("failed to remove spill file {}: {e}", path.display());
            }
        }
        let committed = self.committed_bytes.swap(0, Ordering::AcqRel);
        let _ = self
            .directory_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(committed))
            });
    }
}

/// Sequential frame decoder over the spill file; moved in and out of
/// blocking read tasks.
struct PageFileReader {
    input: BufReader<File>,
    serde: Arc<PageSerde>,
    schema: SchemaRef,
}

impl PageFileReader {
    fn read_up_to(mut self, limit: usize) -> Result<(Self, Vec<RecordBatch>)> {
        let mut pages = Vec::with_capacity(limit);
        while pages.len() < limit {
            match self.serde.read_page(&mut self.input, &self.schema)? {
                Some(page) => pages.push(page),
                None => break,
            }
        }
        Ok((self, pages))
    }
}

enum ReadState {
    /// No read has happened; the read-buffer reservation is not held yet
    Uninitialized,
    /// A blocking read of up to `prefetch_pages` frames is in flight
    ReadInProgress(JoinHandle<Result<(PageFileReader, Vec<RecordBatch>)>>),
    /// Waiting to be polled for the next read round
    Waiting(PageFileReader),
    /// Exhausted or failed
    Done,
}

/// Lazy, forward-only sequence of the pages in a spill file, in spill
/// order. Frame I/O runs on the blocking thread pool, `prefetch_pages`
/// frames per round. The read-buffer reservation is acquired on the
/// first poll and released exactly once, on exhaustion, drop, or
/// spiller close.
pub struct SpilledPageStream {
    schema: SchemaRef,
    serde: Arc<PageSerde>,
    shared: Arc<SpillerShared>,
    prefetch_pages: usize,
    buffered: VecDeque<RecordBatch>,
    state: ReadState,
}

impl SpilledPageStream {
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn poll_next_inner(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<RecordBatch>>> {
        loop {
            if let Some(page) = self.buffered.pop_front() {
                return Poll::Ready(Some(Ok(page)));
            }
            match &mut self.state {
                ReadState::Uninitialized => {
                    if let Err(e) = self.shared.reserve_read_buffer() {
                        self.state = ReadState::Done;
                        return Poll::Ready(Some(Err(e)));
                    }
                    let path = {
                        let guard = self.shared.file.lock();
                        match &*guard {
                            FileState::Open(file) => file.path().to_path_buf(),
                            FileState::Unopened { .. } => {
                                // nothing was ever spilled
                                self.state = ReadState::Done;
                                self.shared.release_read_buffer();
                                return Poll::Ready(None);
                            }
                            FileState::Closed => {
                                self.state = ReadState::Done;
                                return Poll::Ready(Some(Err(FloeError::Internal(
                                    "spiller was closed before the read began".to_string(),
                                ))));
                            }
                        }
                    };
                    let serde = Arc::clone(&self.serde);
                    let schema = Arc::clone(&self.schema);
                    let prefetch = self.prefetch_pages;
                    let task = tokio::task::spawn_blocking(move || {
                        let file = File::open(&path).map_err(FloeError::IoError)?;
                        let reader = PageFileReader {
                            input: BufReader::new(file),
                            serde,
                            schema,
                        };
                        reader.read_up_to(prefetch)
                    });
                    self.state = ReadState::ReadInProgress(task);
                }
                ReadState::ReadInProgress(task) => {
                    let result = futures::ready!(Pin::new(task).poll(cx)).unwrap_or_else(
                        |e| {
                            Err(FloeError::Internal(format!(
                                "spill reader task failed: {e}"
                            )))
                        },
                    );
                    match result {
                        Ok((reader, pages)) => {
                            if pages.is_empty() {
                                self.state = ReadState::Done;
                                self.shared.release_read_buffer();
                                return Poll::Ready(None);
                            }
                            self.buffered.extend(pages);
                            self.state = ReadState::Waiting(reader);
                        }
                        Err(e) => {
                            self.state = ReadState::Done;
                            self.shared.release_read_buffer();
                            return Poll::Ready(Some(Err(e)));
                        }
                    }
                }
                ReadState::Waiting(_) => {
                    let ReadState::Waiting(reader) =
                        mem::replace(&mut self.state, ReadState::Done)
                    else {
                        unreachable!()
                    };
                    let prefetch = self.prefetch_pages;
                    let task =
                        tokio::task::spawn_blocking(move || reader.read_up_to(prefetch));
                    self.state = ReadState::ReadInProgress(task);
                }
                ReadState::Done => return Poll::Ready(None),
            }
        }
    }
}

impl Stream for SpilledPageStream {
    type Item = Result<RecordBatch>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_next_inner(cx)
    }
}

impl Drop for SpilledPageStream {
    fn drop(&mut self) {
        self.shared.release_read_buffer();
    }
}

impl std::fmt::Debug for SpilledPageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpilledPageStream")
            .field("prefetch_pages", &self.prefetch_pages)
            .finish_non_exhaustive()
    }
}
