//! Expert identity.
//!
//! Expert `Origin` is the unmodified backbone; `Task(n)` is the adapter trained
//! on task `n`. Statistics are stored in slots where the origin occupies slot 0
//! and every task adapter is shifted up by one.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of an expert in the mixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExpertId {
    /// Backbone without any task adapter.
    Origin,
    /// Adapter bound to the given task index.
    Task(usize),
}

impl ExpertId {
    /// Statistics slot for this expert (`Origin → 0`, `Task(n) → n + 1`).
    #[inline]
    #[must_use]
    pub fn slot(self) -> usize {
        match self {
            Self::Origin => 0,
            Self::Task(n) => n + 1,
        }
    }

    /// Inverse of [`ExpertId::slot`].
    #[must_use]
    pub fn from_slot(slot: usize) -> Self {
        match slot {
            0 => Self::Origin,
            n => Self::Task(n - 1),
        }
    }

    /// Signed task index form where `-1` denotes the origin backbone.
    ///
    /// Returns `None` for indices below `-1`.
    #[must_use]
    pub fn from_signed(index: i64) -> Option<Self> {
        match index {
            -1 => Some(Self::Origin),
            n if n >= 0 => Some(Self::Task(n as usize)),
            _ => None,
        }
    }

    /// Task index of the adapter, `None` for the origin.
    #[inline]
    #[must_use]
    pub fn task(self) -> Option<usize> {
        match self {
            Self::Origin => None,
            Self::Task(n) => Some(n),
        }
    }

    /// Experts for a model with `num_tasks` registered tasks, origin first.
    pub fn all(num_tasks: usize) -> impl Iterator<Item = ExpertId> {
        std::iter::once(Self::Origin).chain((0..num_tasks).map(Self::Task))
    }
}

impl fmt::Display for ExpertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Origin => write!(f, "origin"),
            Self::Task(n) => write!(f, "task-{}", n),
        }
    }
}

/// Pooling strategy requested from the feature extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractMode {
    /// Concatenate hidden states at the entity marker positions.
    Entity,
    /// Hidden state of the first token.
    Cls,
}
