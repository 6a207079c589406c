//! Allocation name bookkeeping for one task group.

use std::collections::BTreeSet;

use convoy_structs::alloc_name;

use crate::AllocSet;

/// Tracks which `job.group[i]` indexes are taken.
///
/// Placements always take the lowest free index below `count` first and
/// never hand out a name that is already in use.
#[derive(Debug, Clone)]
pub struct AllocNameIndex {
    job: String,
    group: String,
    count: u32,
    used: BTreeSet<u32>,
}

impl AllocNameIndex {
    pub fn new(job: &str, group: &str, count: u32, in_use: &AllocSet) -> Self {
        Self {
            job: job.to_string(),
            group: group.to_string(),
            count,
            used: in_use.values().filter_map(|a| a.index()).collect(),
        }
    }

    fn name(&self, index: u32) -> String {
        alloc_name(&self.job, &self.group, index)
    }

    pub fn is_set(&self, index: u32) -> bool {
        self.used.contains(&index)
    }

    pub fn unset_index(&mut self, index: u32) {
        self.used.remove(&index);
    }

    /// Removes and returns up to `n` of the highest used names.
    pub fn highest(&mut self, n: usize) -> BTreeSet<String> {
        let picked: Vec<u32> = self.used.iter().rev().take(n).copied().collect();
        picked
            .into_iter()
            .map(|idx| {
                self.used.remove(&idx);
                self.name(idx)
            })
            .collect()
    }

    /// Next `n` names for new placements, marking them used.
    pub fn next(&mut self, n: usize) -> Vec<String> {
        let mut out = Vec::with_capacity(n);
        let mut idx = 0u32;
        while out.len() < n {
            if self.used.insert(idx) {
                out.push(self.name(idx));
            }
            idx += 1;
        }
        out
    }

    /// Next `n` canary names.
    ///
    /// Indexes of allocations being destructively updated are preferred, so
    /// each canary shadows an allocation it will eventually replace; then
    /// free indexes below `count`; then indexes past `count`.
    pub fn next_canaries(
        &mut self,
        n: usize,
        existing: &AllocSet,
        destructive: &AllocSet,
    ) -> Vec<String> {
        let existing_names = existing.name_set();
        let mut out = Vec::with_capacity(n);

        let preferred: BTreeSet<u32> = destructive
            .values()
            .filter_map(|a| a.index())
            .filter(|idx| *idx < self.count)
            .collect();
        for idx in preferred {
            if out.len() == n {
                return out;
            }
            let name = self.name(idx);
            if !existing_names.contains(&name) {
                self.used.insert(idx);
                out.push(name);
            }
        }

        for idx in 0..self.count {
            if out.len() == n {
                return out;
            }
            let name = self.name(idx);
            if !self.used.contains(&idx) && !existing_names.contains(&name) {
                self.used.insert(idx);
                out.push(name);
            }
        }

        let mut idx = self.count;
        while out.len() < n {
            let name = self.name(idx);
            if !existing_names.contains(&name) {
                self.used.insert(idx);
                out.push(name);
            }
            idx += 1;
        }
        out
    }
}
