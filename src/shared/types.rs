//! Core type definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque per-replica identifier of a filesystem object.
///
/// On the local replica this is an inode-like identifier rendered as a
/// string; on the remote replica it is the id assigned by the drive.
pub type NodeId = String;

/// Identifier of a row in the sync database.
pub type DbNodeId = i64;

/// Seconds since the Unix epoch.
pub type SyncTime = i64;

/// The two replicas kept convergent by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaSide {
    Local,
    Remote,
}

impl ReplicaSide {
    pub fn other(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

/// Kind of a synchronized object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

impl NodeKind {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Directory,
            2 => Self::Symlink,
            _ => Self::File,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::File => 0,
            Self::Directory => 1,
            Self::Symlink => 2,
        }
    }
}

/// A single change event detected on one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Op {
    Create,
    Edit,
    Move,
    Delete,
}

impl Op {
    const fn bit(self) -> u8 {
        match self {
            Self::Create => 0b0001,
            Self::Edit => 0b0010,
            Self::Move => 0b0100,
            Self::Delete => 0b1000,
        }
    }
}

/// Set of change events carried by an update-tree node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpSet(u8);

impl OpSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn single(op: Op) -> Self {
        Self(op.bit())
    }

    pub fn insert(&mut self, op: Op) {
        self.0 |= op.bit();
    }

    pub fn remove(&mut self, op: Op) {
        self.0 &= !op.bit();
    }

    pub fn contains(self, op: Op) -> bool {
        self.0 & op.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Op> {
        [Op::Create, Op::Edit, Op::Move, Op::Delete]
            .into_iter()
            .filter(move |op| self.contains(*op))
    }
}

impl From<Op> for OpSet {
    fn from(op: Op) -> Self {
        Self::single(op)
    }
}

impl fmt::Display for OpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for op in self.iter() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{op}")?;
            first = false;
        }
        if first {
            write!(f, "None")?;
        }
        Ok(())
    }
}

/// Reconciliation status of an update-tree node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NodeStatus {
    #[default]
    Unprocessed,
    /// One of two coupled events (Move+Edit) has produced its operation.
    PartiallyProcessed,
    Processed,
    /// A conflict-resolution operation was generated for this node.
    ConflictOpGenerated,
}

/// Name rule violated by an item on the target platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Inconsistency {
    ForbiddenChar,
    ReservedName,
    TrailingSpaceOrDot,
    NameTooLong,
    PathTooLong,
    NameClash,
}
