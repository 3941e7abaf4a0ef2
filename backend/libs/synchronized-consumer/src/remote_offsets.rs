use std::collections::HashMap;

use crate::types::{Commit, Partition};

/// Latest committed offset observed on the commit log for every tracked
/// group and partition.
///
/// Entries are overwritten as commits arrive and never removed. No
/// monotonicity is enforced: a replayed commit moves the offset backwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOffsets {
    groups: HashMap<String, HashMap<Partition, u64>>,
}

impl RemoteOffsets {
    /// Create an empty table with one entry per tracked group
    pub fn new<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups
                .into_iter()
                .map(|group| (group.into(), HashMap::new()))
                .collect(),
        }
    }

    pub fn is_tracked(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// Store the commit's offset. Returns `false` for untracked groups.
    pub fn record(&mut self, commit: &Commit) -> bool {
        match self.groups.get_mut(&commit.group) {
            Some(offsets) => {
                offsets.insert(commit.partition.clone(), commit.offset);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, group: &str, partition: &Partition) -> Option<u64> {
        self.groups
            .get(group)
            .and_then(|offsets| offsets.get(partition))
            .copied()
    }

    /// Offset every tracked group has committed past on `partition`.
    ///
    /// Groups that have not reported the partition count as 0, and so does an
    /// empty table.
    pub fn min_offset(&self, partition: &Partition) -> u64 {
        self.groups
            .values()
            .map(|offsets| offsets.get(partition).copied().unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }
}
