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

//! Disk overflow for memory-pressured operators: pages are framed into a
//! per-spiller temp file (optionally compressed and encrypted) and read
//! back as a lazy, memory-bounded stream. All buffer memory is accounted
//! through the reservation contexts of `floe-execution`.

pub mod factory;
pub mod serde;
pub mod spiller;

pub use factory::{SingleStreamSpillerFactory, SpillConfig};
pub use spiller::{
    SingleStreamSpiller, SpillCommittedBytesCallback, SpilledPageStream,
    READ_BUFFER_SIZE, WRITE_BUFFER_SIZE,
};
