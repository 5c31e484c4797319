// Copyright 2025 Evalflow Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Evalflow Core
//!
//! Fundamental data structures shared by the evaluation pipeline: dataset
//! containers (single items and multi-step conversations), raw metric values
//! and the bounded [`Score`] type.

pub mod dataset;
pub mod error;
pub mod score;
pub mod value;

pub use dataset::{Container, Conversation, ConversationStep, Dataset, DatasetItem, ToolCall};
pub use error::{CoreError, Result, ScoreError};
pub use score::Score;
pub use value::{RawValue, ValueType};
