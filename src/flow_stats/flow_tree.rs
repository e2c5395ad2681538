/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::btree_map::{self, BTreeMap};
use std::ops::Bound::{Excluded, Unbounded};

use super::flow_export_info::FlowExportInfo;
use crate::common::FlowKey;

/// Ordered flow table with a persistent walk cursor.
#[derive(Default)]
pub struct FlowEntryTree {
    tree: BTreeMap<FlowKey, FlowExportInfo>,
    // last key visited by the walk
    iteration_key: Option<FlowKey>,
}

/// Keys to visit in one pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Pass {
    pub keys: Vec<FlowKey>,
    // entries remain beyond the end of this pass
    pub backlog: bool,
}

impl FlowEntryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn get(&self, key: &FlowKey) -> Option<&FlowExportInfo> {
        self.tree.get(key)
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut FlowExportInfo> {
        self.tree.get_mut(key)
    }

    pub fn contains_key(&self, key: &FlowKey) -> bool {
        self.tree.contains_key(key)
    }

    pub fn insert(&mut self, key: FlowKey, info: FlowExportInfo) -> Option<FlowExportInfo> {
        self.tree.insert(key, info)
    }

    pub fn remove(&mut self, key: &FlowKey) -> Option<FlowExportInfo> {
        self.tree.remove(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, FlowKey, FlowExportInfo> {
        self.tree.iter()
    }

    pub fn iteration_key(&self) -> Option<&FlowKey> {
        self.iteration_key.as_ref()
    }

    /// Collects at most `budget` keys following the cursor and advances it.
    ///
    /// A pass never wraps around: when the end of the table is reached the
    /// cursor resets and the next pass starts from the first key. A cursor
    /// past the last key, e.g. after the table shrank, wraps immediately.
    pub fn next_pass(&mut self, budget: usize) -> Pass {
        if self.tree.is_empty() || budget == 0 {
            self.iteration_key = None;
            return Pass::default();
        }

        let start = match self.iteration_key {
            Some(k) if self.tree.range((Excluded(k), Unbounded)).next().is_some() => {
                Excluded(k)
            }
            _ => Unbounded,
        };
        let mut range = self.tree.range((start, Unbounded));
        let keys: Vec<FlowKey> = range.by_ref().take(budget).map(|(k, _)| *k).collect();
        let backlog = range.next().is_some();

        self.iteration_key = if backlog { keys.last().copied() } else { None };
        Pass { keys, backlog }
    }
}
