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

//! [`SingleStreamSpillerFactory`]: constructs spillers and arbitrates
//! which spill directory each one writes to.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use log::debug;

use floe_common::{FloeError, Result};
use floe_execution::memory_pool::LocalMemoryContext;

use crate::serde::PageSerde;
use crate::spiller::{SingleStreamSpiller, SpillCommittedBytesCallback};

/// Assumed capacity of each spill directory when no explicit value is
/// configured.
pub const DEFAULT_DIRECTORY_CAPACITY: u64 = 100 * 1024 * 1024 * 1024; // 100GB

/// Configuration for [`SingleStreamSpillerFactory`].
#[derive(Clone, Debug)]
pub struct SpillConfig {
    spill_directories: Vec<PathBuf>,
    /// A directory stops accepting new spillers once its tracked usage
    /// reaches this fraction of its capacity. Must be in `(0, 1]`.
    max_used_space_fraction: f64,
    directory_capacity_bytes: u64,
    compression: bool,
    encryption: bool,
    direct_serde: bool,
    prefetch_pages: usize,
}

impl SpillConfig {
    pub fn new(spill_directories: Vec<PathBuf>) -> Self {
        Self {
            spill_directories,
            max_used_space_fraction: 0.9,
            directory_capacity_bytes: DEFAULT_DIRECTORY_CAPACITY,
            compression: false,
            encryption: false,
            direct_serde: false,
            prefetch_pages: 1,
        }
    }

    pub fn with_max_used_space_fraction(mut self, fraction: f64) -> Self {
        self.max_used_space_fraction = fraction;
        self
    }

    pub fn with_directory_capacity_bytes(mut self, bytes: u64) -> Self {
        self.directory_capacity_bytes = bytes;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encryption = enabled;
        self
    }

    /// Serialize frames straight into the file writer instead of
    /// staging each frame in an intermediate buffer first. Lower copy
    /// overhead, identical output.
    pub fn with_direct_serde(mut self, enabled: bool) -> Self {
        self.direct_serde = enabled;
        self
    }

    /// Frames decoded per blocking read round during read-back. A
    /// tuning knob with no effect on observable results.
    pub fn with_prefetch_pages(mut self, pages: usize) -> Self {
        self.prefetch_pages = pages;
        self
    }
}

struct SpillDirectory {
    path: PathBuf,
    used_bytes: Arc<AtomicU64>,
}

/// Creates [`SingleStreamSpiller`]s bound to a schema and a memory
/// context, rotating round-robin over the configured directories and
/// skipping directories whose tracked usage exceeds the admissible
/// fraction of their capacity.
pub struct SingleStreamSpillerFactory {
    directories: Vec<SpillDirectory>,
    next_directory: AtomicUsize,
    max_used_space_fraction: f64,
    directory_capacity_bytes: u64,
    compression: bool,
    encryption: bool,
    direct_serde: bool,
    prefetch_pages: usize,
}

impl SingleStreamSpillerFactory {
    pub fn try_new(config: SpillConfig) -> Result<Self> {
        if config.spill_directories.is_empty() {
            return Err(FloeError::Internal(
                "at least one spill directory is required".to_string(),
            ));
        }
        if !(config.max_used_space_fraction > 0.0 && config.max_used_space_fraction <= 1.0)
        {
            return Err(FloeError::Internal(format!(
                "invalid max used space fraction. Expected greater than 0 and at most 1.0, got {}",
                config.max_used_space_fraction
            )));
        }
        if config.prefetch_pages == 0 {
            return Err(FloeError::Internal(
                "prefetch page count must be positive".to_string(),
            ));
        }
        let mut directories = Vec::with_capacity(config.spill_directories.len());
        for path in &config.spill_directories {
            if !path.exists() {
                fs::create_dir_all(path)?;
            }
            directories.push(SpillDirectory {
                path: path.clone(),
                used_bytes: Arc::new(AtomicU64::new(0)),
            });
        }
        debug!(
            "Created spiller factory over directories {:?}",
            config.spill_directories
        );
        Ok(Self {
            directories,
            next_directory: AtomicUsize::new(0),
            max_used_space_fraction: config.max_used_space_fraction,
            directory_capacity_bytes: config.directory_capacity_bytes,
            compression: config.compression,
            encryption: config.encryption,
            direct_serde: config.direct_serde,
            prefetch_pages: config.prefetch_pages,
        })
    }

    /// Construct a spiller for `schema`, charging its buffer memory to
    /// `memory_context`. The write-buffer reservation is taken here,
    /// before any page is written; the backing file itself appears on
    /// the first spill.
    pub fn create(
        &self,
        schema: SchemaRef,
        committed_bytes_callback: SpillCommittedBytesCallback,
        memory_context: LocalMemoryContext,
    ) -> Result<SingleStreamSpiller> {
        let directory = self.select_directory()?;
        let serde = Arc::new(PageSerde::new(self.compression, self.encryption));
        SingleStreamSpiller::new(
            schema,
            serde,
            directory.path.clone(),
            Arc::clone(&directory.used_bytes),
            self.prefetch_pages,
            self.direct_serde,
            committed_bytes_callback,
            memory_context,
        )
    }

    fn select_directory(&self) -> Result<&SpillDirectory> {
        let usable_limit =
            (self.directory_capacity_bytes as f64 * self.max_used_space_fraction) as u64;
        let start = self.next_directory.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.directories.len() {
            let directory = &self.directories[(start + offset) % self.directories.len()];
            if directory.used_bytes.load(Ordering::Acquire) < usable_limit {
                return Ok(directory);
            }
        }
        Err(FloeError::IoError(io::Error::other(
            "no spill directory has usable space left",
        )))
    }
}

impl std::fmt::Debug for SingleStreamSpillerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleStreamSpillerFactory")
            .field(
                "directories",
                &self
                    .directories
                    .iter()
                    .map(|d| d.path.clone())
                    .collect::<Vec<_>>(),
            )
            .field("compression", &self.compression)
            .field("encryption", &self.encryption)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field, Schema};
    use floe_execution::memory_pool::AggregatedMemoryContext;
    use tempfile::TempDir;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    fn memory_context() -> LocalMemoryContext {
        AggregatedMemoryContext::new_simple().new_local("test")
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(SingleStreamSpillerFactory::try_new(SpillConfig::new(vec![])).is_err());

        let dir = TempDir::new().unwrap();
        let bad_fraction =
            SpillConfig::new(vec![dir.path().to_path_buf()]).with_max_used_space_fraction(0.0);
        assert!(SingleStreamSpillerFactory::try_new(bad_fraction).is_err());

        let bad_fraction =
            SpillConfig::new(vec![dir.path().to_path_buf()]).with_max_used_space_fraction(1.5);
        assert!(SingleStreamSpillerFactory::try_new(bad_fraction).is_err());

        let bad_prefetch =
            SpillConfig::new(vec![dir.path().to_path_buf()]).with_prefetch_pages(0);
        assert!(SingleStreamSpillerFactory::try_new(bad_prefetch).is_err());
    }

    #[test]
    fn creates_missing_directories() {
        let root = TempDir::new().unwrap();
        let nested = root.path().join("spill").join("a");
        let factory =
            SingleStreamSpillerFactory::try_new(SpillConfig::new(vec![nested.clone()]))
                .unwrap();
        assert!(nested.is_dir());
        drop(factory);
    }

    #[tokio::test]
    async fn full_directories_are_skipped_then_exhausted() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let config = SpillConfig::new(vec![
            dir_a.path().to_path_buf(),
            dir_b.path().to_path_buf(),
        ])
        // a single frame overflows one byte of capacity
        .with_directory_capacity_bytes(1)
        .with_max_used_space_fraction(1.0);
        let factory = SingleStreamSpillerFactory::try_new(config).unwrap();

        let page = arrow::record_batch::RecordBatch::try_new(
            schema(),
            vec![Arc::new(arrow::array::Int64Array::from(vec![1, 2, 3]))],
        )
        .unwrap();

        let first = factory
            .create(schema(), Box::new(|_| {}), memory_context())
            .unwrap();
        first.spill(page.clone()).await.unwrap();

        let second = factory
            .create(schema(), Box::new(|_| {}), memory_context())
            .unwrap();
        second.spill(page.clone()).await.unwrap();

        // both directories are now over their usable limit
        let err = factory
            .create(schema(), Box::new(|_| {}), memory_context())
            .unwrap_err();
        assert!(matches!(err, FloeError::IoError(_)), "{err}");

        // closing a spiller returns its bytes to the directory ledger
        first.close();
        factory
            .create(schema(), Box::new(|_| {}), memory_context())
            .unwrap();
    }
}
