//! Opaque identifiers for cluster entities.
//!
//! Identifiers minted by the master concatenate the master's epoch with a
//! monotonically increasing counter, so they are unique across failovers
//! and lexicographically comparable.

use std::marker::PhantomData;

use crate::error::{MasterError, MasterResult};

macro_rules! define_id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id_type!(FrameworkId);
define_id_type!(WorkerId);
define_id_type!(OfferId);
define_id_type!(TaskId);
define_id_type!(ExecutorId);

/// Mints epoch-prefixed identifiers of one kind.
#[derive(Debug)]
pub struct IdGenerator<T: From<String>> {
    epoch: String,
    next_value: u64,
    phantom: PhantomData<T>,
}

impl<T: From<String>> IdGenerator<T> {
    pub fn new(epoch: impl Into<String>) -> Self {
        Self {
            epoch: epoch.into(),
            next_value: 0,
            phantom: PhantomData,
        }
    }

    pub fn next(&mut self) -> MasterResult<T> {
        let value = self.next_value;
        self.next_value = value
            .checked_add(1)
            .ok_or_else(|| MasterError::InternalError("ID overflow".to_string()))?;
        Ok(T::from(format!("{}-{}", self.epoch, value)))
    }
}

/// The composite key identifying a task: task identifiers are only unique
/// within their framework.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub framework_id: FrameworkId,
    pub task_id: TaskId,
}

impl TaskKey {
    pub fn new(framework_id: FrameworkId, task_id: TaskId) -> Self {
        Self {
            framework_id,
            task_id,
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task {} of framework {}", self.task_id, self.framework_id)
    }
}
