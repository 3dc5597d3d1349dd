use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;

use crate::error::{ConsensusError, Result};
use crate::reachability::{Interval, ReachabilityManager};
use crate::staging::StagingArea;
use crate::types::Hash;

/// State of one reindex operation. Subtree sizes are cached for its duration.
pub(super) struct ReindexContext<'a> {
    manager: &'a ReachabilityManager,
    area: &'a mut StagingArea,
    subtree_sizes: HashMap<Hash, u64>,
    slack: u64,
}

impl<'a> ReindexContext<'a> {
    pub(super) fn new(manager: &'a ReachabilityManager, area: &'a mut StagingArea) -> Self {
        Self { manager, area, subtree_sizes: HashMap::new(), slack: manager.reindex_slack }
    }

    fn interval(&self, block: Hash) -> Result<Interval> {
        self.manager.interval(self.area, block)
    }

    fn parent(&self, block: Hash) -> Result<Hash> {
        self.manager.tree_parent(self.area, block)
    }

    fn children(&self, block: Hash) -> Result<Vec<Hash>> {
        self.manager.children(self.area, block)
    }

    fn set_interval(&mut self, block: Hash, interval: Interval) -> Result<()> {
        self.manager.stats.reallocations.fetch_add(1, Ordering::Relaxed);
        self.manager.set_interval(self.area, block, interval)
    }

    fn subtree_size(&self, block: Hash) -> Result<u64> {
        self.subtree_sizes
            .get(&block)
            .copied()
            .ok_or_else(|| ConsensusError::Invariant(format!("subtree of {block} was not counted")))
    }

    /// Climbs from `new_child` to the first ancestor whose interval can hold
    /// its subtree and reallocates everything below it. Below the reindex
    /// root, space is reclaimed from the slack of the chain up to the root
    /// instead.
    pub(super) fn reindex_intervals(&mut self, new_child: Hash, reindex_root: Hash) -> Result<()> {
        let mut current = new_child;
        loop {
            let current_interval = self.interval(current)?;
            self.count_subtrees(current)?;
            let current_size = self.subtree_size(current)?;
            if current_interval.size() >= current_size {
                break;
            }

            let Some(parent) = self.manager.data(self.area, &current)?.parent else {
                return Err(ConsensusError::Invariant("reachability interval space exhausted".to_string()));
            };
            if current == reindex_root {
                return Err(ConsensusError::Invariant(format!(
                    "reindex root {reindex_root} has no room for its subtree"
                )));
            }
            if self.manager.is_strict_chain_ancestor_of(self.area, parent, reindex_root)? {
                // Double the capacity of `current` using slack along the chain up to the root
                return self.reindex_intervals_earlier_than_root(current, reindex_root, parent, current_size);
            }
            current = parent;
        }
        self.propagate_interval(current)
    }

    /// Iterative post-order subtree count; deep chains would overflow a recursive version
    fn count_subtrees(&mut self, block: Hash) -> Result<()> {
        if self.subtree_sizes.contains_key(&block) {
            return Ok(());
        }
        let mut queue = VecDeque::from([block]);
        let mut counts: HashMap<Hash, u64> = HashMap::new();
        while let Some(mut current) = queue.pop_front() {
            let children = self.children(current)?;
            if children.is_empty() {
                self.subtree_sizes.insert(current, 1);
            } else if !self.subtree_sizes.contains_key(&current) {
                queue.extend(children);
                continue;
            }
            // A leaf or an already counted subtree: push counts upward
            while current != block {
                current = self.parent(current)?;
                let count = counts.entry(current).or_insert(0);
                *count += 1;
                let children = self.children(current)?;
                if *count < children.len() as u64 {
                    break;
                }
                let mut sum = 0u64;
                for child in &children {
                    sum += self.subtree_size(*child)?;
                }
                self.subtree_sizes.insert(current, sum + 1);
            }
        }
        Ok(())
    }

    /// Reallocates the intervals of the whole subtree under `block` by BFS,
    /// splitting each capacity exponentially by subtree size
    fn propagate_interval(&mut self, block: Hash) -> Result<()> {
        self.count_subtrees(block)?;
        let mut queue = VecDeque::from([block]);
        while let Some(current) = queue.pop_front() {
            let children = self.children(current)?;
            if children.is_empty() {
                continue;
            }
            let sizes = children.iter().map(|child| self.subtree_size(*child)).collect::<Result<Vec<u64>>>()?;
            let capacity = self.manager.children_capacity(self.area, current)?;
            let intervals = capacity.split_exponential(&sizes)?;
            for (child, interval) in children.iter().zip(intervals) {
                self.set_interval(*child, interval)?;
            }
            queue.extend(children);
        }
        Ok(())
    }

    fn reindex_intervals_earlier_than_root(
        &mut self,
        allocation_block: Hash,
        reindex_root: Hash,
        common_ancestor: Hash,
        required_allocation: u64,
    ) -> Result<()> {
        let chosen_child = self.manager.next_chain_ancestor_unchecked(self.area, reindex_root, common_ancestor)?;
        let block_interval = self.interval(allocation_block)?;
        let chosen_interval = self.interval(chosen_child)?;
        if block_interval.start < chosen_interval.start {
            self.reclaim_interval_before(allocation_block, common_ancestor, chosen_child, reindex_root, required_allocation)
        } else {
            // New side branches are appended last, so room reclaimed beyond the
            // block's own need is left to the common ancestor for later siblings.
            // Reserving one unit per existing sibling doubles the room each time.
            let reserve = self.children(common_ancestor)?.len() as u64;
            self.reclaim_interval_after(
                allocation_block,
                common_ancestor,
                chosen_child,
                reindex_root,
                required_allocation,
                reserve,
            )
        }
    }

    fn reclaim_interval_before(
        &mut self,
        allocation_block: Hash,
        common_ancestor: Hash,
        chosen_child: Hash,
        reindex_root: Hash,
        required_allocation: u64,
    ) -> Result<()> {
        let mut slack_sum = 0u64;
        let mut path_len = 0u64;
        let mut path_slack_alloc = 0u64;
        let mut current = chosen_child;

        // Walk up the chain toward the reindex root collecting slack
        loop {
            if current == reindex_root {
                // The root is unbounded: take what is missing plus fresh slack for the path
                let offset = required_allocation + self.slack * path_len - slack_sum;
                self.apply_interval_op_and_propagate(current, offset, Interval::increase_start)?;
                self.offset_siblings_before(allocation_block, current, offset)?;
                path_slack_alloc = self.slack;
                break;
            }
            let slack_before_current = self.manager.remaining_before(self.area, current)?.size();
            slack_sum += slack_before_current;
            if slack_sum >= required_allocation {
                let offset = slack_before_current - (slack_sum - required_allocation);
                self.apply_interval_op(current, offset, Interval::increase_start)?;
                self.offset_siblings_before(allocation_block, current, offset)?;
                break;
            }
            current = self.manager.next_chain_ancestor_unchecked(self.area, reindex_root, current)?;
            path_len += 1;
        }

        // Walk back down, handing the reclaimed space to the siblings on the way
        loop {
            current = self.parent(current)?;
            if current == common_ancestor {
                break;
            }
            let slack_before_current = self.manager.remaining_before(self.area, current)?.size();
            let offset = slack_before_current - path_slack_alloc;
            self.apply_interval_op(current, offset, Interval::increase_start)?;
            self.offset_siblings_before(allocation_block, current, offset)?;
        }
        Ok(())
    }

    fn reclaim_interval_after(
        &mut self,
        allocation_block: Hash,
        common_ancestor: Hash,
        chosen_child: Hash,
        reindex_root: Hash,
        required_allocation: u64,
        reserve: u64,
    ) -> Result<()> {
        let required_allocation = required_allocation + reserve;
        let mut slack_sum = 0u64;
        let mut path_len = 0u64;
        let mut path_slack_alloc = 0u64;
        let mut current = chosen_child;

        loop {
            if current == reindex_root {
                let offset = required_allocation + self.slack * path_len - slack_sum;
                self.apply_interval_op_and_propagate(current, offset, Interval::decrease_end)?;
                self.offset_siblings_after(allocation_block, current, offset, reserve)?;
                path_slack_alloc = self.slack;
                break;
            }
            let slack_after_current = self.manager.remaining_after(self.area, current)?.size();
            slack_sum += slack_after_current;
            if slack_sum >= required_allocation {
                let offset = slack_after_current - (slack_sum - required_allocation);
                self.apply_interval_op(current, offset, Interval::decrease_end)?;
                self.offset_siblings_after(allocation_block, current, offset, reserve)?;
                break;
            }
            current = self.manager.next_chain_ancestor_unchecked(self.area, reindex_root, current)?;
            path_len += 1;
        }

        loop {
            current = self.parent(current)?;
            if current == common_ancestor {
                break;
            }
            let slack_after_current = self.manager.remaining_after(self.area, current)?.size();
            let offset = slack_after_current - path_slack_alloc;
            self.apply_interval_op(current, offset, Interval::decrease_end)?;
            self.offset_siblings_after(allocation_block, current, offset, reserve)?;
        }
        Ok(())
    }

    fn offset_siblings_before(&mut self, allocation_block: Hash, current: Hash, offset: u64) -> Result<()> {
        let parent = self.parent(current)?;
        let children = self.children(parent)?;
        let (siblings_before, _) = split_children(&children, current)?;
        for sibling in siblings_before.iter().rev().copied() {
            if sibling == allocation_block {
                self.apply_interval_op_and_propagate(allocation_block, offset, Interval::increase_end)?;
                break;
            }
            self.apply_interval_op_and_propagate(sibling, offset, Interval::increase)?;
        }
        Ok(())
    }

    /// Shifts the siblings after `current` down by `offset`. The allocation
    /// block grows by `offset`, minus `reserve` when it is the last child.
    fn offset_siblings_after(&mut self, allocation_block: Hash, current: Hash, offset: u64, reserve: u64) -> Result<()> {
        let parent = self.parent(current)?;
        let children = self.children(parent)?;
        let (_, siblings_after) = split_children(&children, current)?;
        for sibling in siblings_after.iter().copied() {
            if sibling == allocation_block {
                let grown = self.interval(allocation_block)?.decrease_start(offset);
                let interval =
                    if siblings_after.last() == Some(&allocation_block) { grown.decrease_end(reserve) } else { grown };
                self.set_interval(allocation_block, interval)?;
                self.propagate_interval(allocation_block)?;
                break;
            }
            self.apply_interval_op_and_propagate(sibling, offset, Interval::decrease)?;
        }
        Ok(())
    }

    fn apply_interval_op(&mut self, block: Hash, offset: u64, op: fn(&Interval, u64) -> Interval) -> Result<()> {
        let interval = self.interval(block)?;
        self.set_interval(block, op(&interval, offset))
    }

    fn apply_interval_op_and_propagate(
        &mut self,
        block: Hash,
        offset: u64,
        op: fn(&Interval, u64) -> Interval,
    ) -> Result<()> {
        self.apply_interval_op(block, offset, op)?;
        self.propagate_interval(block)
    }

    /// Moves the interval space of `parent` toward `child` as the reindex root descends
    pub(super) fn concentrate_interval(&mut self, parent: Hash, child: Hash, is_final_reindex_root: bool) -> Result<()> {
        let children = self.children(parent)?;
        let (before, after) = split_children(&children, child)?;
        let before_sum = self.tighten_intervals_before(parent, before)?;
        let after_sum = self.tighten_intervals_after(parent, after)?;
        self.expand_interval_to_chosen(parent, child, before_sum, after_sum, is_final_reindex_root)
    }

    fn subtree_sizes_of(&mut self, blocks: &[Hash]) -> Result<Vec<u64>> {
        let mut sizes = Vec::with_capacity(blocks.len());
        for block in blocks {
            self.count_subtrees(*block)?;
            sizes.push(self.subtree_size(*block)?);
        }
        Ok(sizes)
    }

    fn tighten_intervals_before(&mut self, parent: Hash, children_before: &[Hash]) -> Result<u64> {
        let sizes = self.subtree_sizes_of(children_before)?;
        let sum: u64 = sizes.iter().sum();
        let interval = self.interval(parent)?;
        let interval_before = Interval::new(interval.start + self.slack, interval.start + self.slack + sum - 1);
        for (child, child_interval) in children_before.iter().zip(interval_before.split_exact(&sizes)?) {
            self.set_interval(*child, child_interval)?;
            self.propagate_interval(*child)?;
        }
        Ok(sum)
    }

    fn tighten_intervals_after(&mut self, parent: Hash, children_after: &[Hash]) -> Result<u64> {
        let sizes = self.subtree_sizes_of(children_after)?;
        let sum: u64 = sizes.iter().sum();
        let interval = self.interval(parent)?;
        let interval_after = Interval::new(interval.end - self.slack - sum, interval.end - self.slack - 1);
        for (child, child_interval) in children_after.iter().zip(interval_after.split_exact(&sizes)?) {
            self.set_interval(*child, child_interval)?;
            self.propagate_interval(*child)?;
        }
        Ok(sum)
    }

    fn expand_interval_to_chosen(
        &mut self,
        parent: Hash,
        child: Hash,
        before_sum: u64,
        after_sum: u64,
        is_final_reindex_root: bool,
    ) -> Result<()> {
        let interval = self.interval(parent)?;
        let allocation =
            Interval::new(interval.start + before_sum + self.slack, interval.end - after_sum - self.slack - 1);
        let current = self.interval(child)?;
        if is_final_reindex_root && !allocation.contains(current) {
            // Propagate a narrowed interval so the next `reindex_depth` root moves
            // find the chain already inside their allocation
            let margin = (self.slack * self.manager.reindex_depth).min(allocation.size() / 4);
            let narrowed = Interval::new(allocation.start + margin, allocation.end - margin);
            self.set_interval(child, narrowed)?;
            self.propagate_interval(child)?;
        }
        self.set_interval(child, allocation)
    }
}

fn split_children(children: &[Hash], pivot: Hash) -> Result<(&[Hash], &[Hash])> {
    match children.iter().position(|child| *child == pivot) {
        Some(index) => Ok((&children[..index], &children[index + 1..])),
        None => Err(ConsensusError::Invariant(format!("{pivot} is not among the expected tree children"))),
    }
}
