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

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised when constructing a [`crate::Score`]
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ScoreError {
    #[error("Score {0} is outside [0, 1]")]
    OutOfRange(f64),

    #[error("Score is not a finite number")]
    NotFinite,
}

/// Errors from the core data model
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Failed to read dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse dataset: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Duplicate target id in dataset: {0}")]
    DuplicateTargetId(String),

    #[error(transparent)]
    Score(#[from] ScoreError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
