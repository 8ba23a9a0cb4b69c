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

//! floe error types

use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::result;

use arrow::error::ArrowError;

use crate::display::human_readable_size;

/// Result type for operations that could result in a [FloeError]
pub type Result<T> = result::Result<T, FloeError>;

/// floe error
#[derive(Debug)]
pub enum FloeError {
    /// Error returned by arrow while encoding or decoding pages.
    ArrowError(ArrowError),
    /// Error associated to I/O operations, including spill file
    /// creation, write and read failures.
    IoError(io::Error),
    /// A reservation would push the query over its user memory limit.
    /// Carries the configured limit and a diagnostic snapshot of the
    /// largest consumers.
    ExceededUserMemoryLimit {
        /// Configured per-query user memory limit, in bytes
        limit: u64,
        /// Allocation snapshot rendered into the failure message
        details: String,
    },
    /// A reservation would push the query over its total (user + system)
    /// memory limit.
    ExceededTotalMemoryLimit {
        /// Configured per-query total memory limit, in bytes
        limit: u64,
        /// Allocation snapshot rendered into the failure message
        details: String,
    },
    /// A spill-disk reservation would exceed the configured ceiling.
    ExceededSpillLimit {
        /// Configured spill limit, in bytes
        limit: u64,
        /// Whether the per-query or the node-wide ceiling was hit
        per_query: bool,
    },
    /// A non-blocking reservation was attempted on a memory kind that
    /// only supports the blocking path.
    UnsupportedReservationMode(&'static str),
    /// A task-instance lookup named an id that was never registered or
    /// was already removed. Indicates a lifecycle bug upstream.
    UnknownTask(String),
    /// A spill frame failed structural validation on read-back:
    /// unknown marker bits, inconsistent lengths, or failed
    /// decompression/authentication.
    SpillCorruption(String),
    /// Broken invariant or API misuse inside floe. These are bugs,
    /// not recoverable conditions.
    Internal(String),
}

impl From<io::Error> for FloeError {
    fn from(e: io::Error) -> Self {
        FloeError::IoError(e)
    }
}

impl From<ArrowError> for FloeError {
    fn from(e: ArrowError) -> Self {
        FloeError::ArrowError(e)
    }
}

impl Display for FloeError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            FloeError::ArrowError(desc) => write!(f, "Arrow error: {desc}"),
            FloeError::IoError(desc) => write!(f, "IO error: {desc}"),
            FloeError::ExceededUserMemoryLimit { limit, details } => {
                write!(
                    f,
                    "Query exceeded per-node user memory limit of {} [{}]",
                    human_readable_size(*limit),
                    details
                )
            }
            FloeError::ExceededTotalMemoryLimit { limit, details } => {
                write!(
                    f,
                    "Query exceeded per-node total memory limit of {} [{}]",
                    human_readable_size(*limit),
                    details
                )
            }
            FloeError::ExceededSpillLimit { limit, per_query } => {
                if *per_query {
                    write!(
                        f,
                        "Query exceeded per-query local spill limit of {}",
                        human_readable_size(*limit)
                    )
                } else {
                    write!(
                        f,
                        "Exceeded spill limit of {}",
                        human_readable_size(*limit)
                    )
                }
            }
            FloeError::UnsupportedReservationMode(desc) => {
                write!(f, "Unsupported reservation mode: {desc}")
            }
            FloeError::UnknownTask(id) => {
                write!(f, "Unknown task instance: {id}")
            }
            FloeError::SpillCorruption(desc) => {
                write!(f, "Spill file corrupted: {desc}")
            }
            FloeError::Internal(desc) => {
                write!(
                    f,
                    "Internal error: {desc}. This was likely caused by a bug in \
                     floe's code and we would welcome that you file an bug report \
                     in our issue tracker"
                )
            }
        }
    }
}

impl error::Error for FloeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            FloeError::ArrowError(e) => Some(e),
            FloeError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_errors_carry_readable_limits() {
        let err = FloeError::ExceededUserMemoryLimit {
            limit: 100 * 1024 * 1024,
            details: "Allocated: 60.0 MB, Delta: 50.0 MB".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("user memory limit of 100.0 MB"), "{msg}");
        assert!(msg.contains("Allocated: 60.0 MB"), "{msg}");

        let err = FloeError::ExceededSpillLimit {
            limit: 1024,
            per_query: true,
        };
        assert_eq!(
            err.to_string(),
            "Query exceeded per-query local spill limit of 1.0 KB"
        );
    }

    #[test]
    fn io_errors_keep_their_source() {
        let err = FloeError::from(io::Error::new(io::ErrorKind::Other, "disk gone"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("disk gone"));
    }
}
