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

//! Resource accounting for the floe query runtime: the node-wide memory
//! pool, the per-query hierarchical memory contexts, the node-wide
//! spill-disk budget and the per-query [`query_context::QueryContext`]
//! that ties them together.

pub mod disk_manager;
pub mod memory_pool;
pub mod query_context;
pub mod query_id;
pub mod task_context;

pub use query_id::QueryId;
