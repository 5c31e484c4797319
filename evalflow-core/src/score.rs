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

//! Bounded score type

use crate::error::ScoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A normalized value in `[0, 1]`.
///
/// Construction fails for anything outside the unit interval. The only way to
/// pull an out-of-range number into range is [`Score::clamped`], which
/// normalizers call when clipping was explicitly requested.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Score(f64);

impl Score {
    pub const ZERO: Score = Score(0.0);
    pub const HALF: Score = Score(0.5);
    pub const ONE: Score = Score(1.0);

    pub fn new(value: f64) -> Result<Self, ScoreError> {
        if !value.is_finite() {
            return Err(ScoreError::NotFinite);
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(ScoreError::OutOfRange(value));
        }
        Ok(Score(value))
    }

    /// Clamp into `[0, 1]`. NaN is still rejected.
    pub fn clamped(value: f64) -> Result<Self, ScoreError> {
        if value.is_nan() {
            return Err(ScoreError::NotFinite);
        }
        Ok(Score(value.clamp(0.0, 1.0)))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// `1 - score`
    pub fn complement(self) -> Score {
        Score(1.0 - self.0)
    }
}

impl TryFrom<f64> for Score {
    type Error = ScoreError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Score::new(value)
    }
}

impl From<Score> for f64 {
    fn from(score: Score) -> Self {
        score.0
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}
