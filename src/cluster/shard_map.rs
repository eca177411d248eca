//! Slot ownership map
//!
//! Built from a CLUSTER NODES reply. Immutable once built: a MOVED redirect
//! produces a new map via [`ShardMap::with_relocated`] which is then
//! published in place of the old one.

use std::collections::HashMap;

use super::node::{parse_cluster_node_line, ClusterNodeEntry};
use super::slot::TOTAL_SLOTS;
use crate::config::ServerAddress;
use crate::utils::ClusterError;

const UNASSIGNED: u16 = u16::MAX;

/// Contiguous run of slots owned by one primary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub owner: ServerAddress,
}

/// Slot to owning primary mapping
#[derive(Clone)]
pub struct ShardMap {
    /// Distinct owners; `slots` stores indices into this
    owners: Vec<ServerAddress>,
    /// Owner index per slot, `UNASSIGNED` if nobody owns it
    slots: Box<[u16]>,
}

impl std::fmt::Debug for ShardMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardMap")
            .field("ranges", &self.ranges())
            .finish()
    }
}

impl Default for ShardMap {
    fn default() -> Self {
        Self::empty()
    }
}

impl ShardMap {
    pub fn empty() -> Self {
        Self {
            owners: Vec::new(),
            slots: vec![UNASSIGNED; TOTAL_SLOTS as usize].into_boxed_slice(),
        }
    }

    /// Build from explicit ranges; ranges must be disjoint
    pub fn from_ranges<I>(ranges: I) -> Result<Self, ClusterError>
    where
        I: IntoIterator<Item = SlotRange>,
    {
        let mut map = Self::empty();
        let mut owner_index: HashMap<ServerAddress, u16> = HashMap::new();

        for range in ranges {
            if range.end >= TOTAL_SLOTS || range.start > range.end {
                return Err(ClusterError::ParseFailed(format!(
                    "invalid slot range {}-{}",
                    range.start, range.end
                )));
            }
            let idx = *owner_index.entry(range.owner.clone()).or_insert_with(|| {
                map.owners.push(range.owner.clone());
                (map.owners.len() - 1) as u16
            });
            for slot in range.start..=range.end {
                let cell = &mut map.slots[slot as usize];
                if *cell != UNASSIGNED && *cell != idx {
                    return Err(ClusterError::OverlappingRanges(slot));
                }
                *cell = idx;
            }
        }

        Ok(map)
    }

    /// Parse CLUSTER NODES response
    ///
    /// Returns the map together with every parsed node so the caller can
    /// learn roles and replica relationships.
    pub fn from_cluster_nodes(
        response: &str,
        queried: &ServerAddress,
    ) -> Result<(Self, Vec<ClusterNodeEntry>), ClusterError> {
        let nodes: Vec<ClusterNodeEntry> = response
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| parse_cluster_node_line(l, &queried.host))
            .collect();

        if nodes.is_empty() {
            return Err(ClusterError::ParseFailed("no node lines".to_string()));
        }
        if !nodes.iter().any(|n| n.is_primary) {
            return Err(ClusterError::NoPrimaries);
        }

        let ranges = nodes
            .iter()
            .filter(|n| n.is_primary)
            .flat_map(|n| {
                n.slot_ranges.iter().map(move |&(start, end)| SlotRange {
                    start,
                    end,
                    owner: n.address.clone(),
                })
            });

        let map = Self::from_ranges(ranges)?;
        Ok((map, nodes))
    }

    /// Owner of `slot`
    pub fn node_for(&self, slot: u16) -> Option<&ServerAddress> {
        match self.slots.get(slot as usize) {
            Some(&idx) if idx != UNASSIGNED => self.owners.get(idx as usize),
            _ => None,
        }
    }

    /// Copy of this map with `slot` owned by `owner`
    pub fn with_relocated(&self, slot: u16, owner: &ServerAddress) -> Self {
        let mut next = self.clone();
        if slot >= TOTAL_SLOTS {
            return next;
        }
        let idx = match next.owners.iter().position(|o| o == owner) {
            Some(idx) => idx as u16,
            None => {
                next.owners.push(owner.clone());
                (next.owners.len() - 1) as u16
            }
        };
        next.slots[slot as usize] = idx;
        next
    }

    /// Every slot has an owner
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|&idx| idx != UNASSIGNED)
    }

    pub fn assigned_slots(&self) -> usize {
        self.slots.iter().filter(|&&idx| idx != UNASSIGNED).count()
    }

    /// Number of slots owned by `owner`
    pub fn slots_owned_by(&self, owner: &ServerAddress) -> usize {
        match self.owners.iter().position(|o| o == owner) {
            Some(idx) => self.slots.iter().filter(|&&s| s as usize == idx).count(),
            None => 0,
        }
    }

    /// Owners that still own at least one slot
    pub fn owners(&self) -> Vec<&ServerAddress> {
        let mut seen = vec![false; self.owners.len()];
        for &idx in self.slots.iter() {
            if idx != UNASSIGNED {
                seen[idx as usize] = true;
            }
        }
        self.owners
            .iter()
            .zip(seen)
            .filter_map(|(o, s)| s.then_some(o))
            .collect()
    }

    /// Ordered, disjoint ranges
    pub fn ranges(&self) -> Vec<SlotRange> {
        let mut ranges: Vec<SlotRange> = Vec::new();
        for (slot, &idx) in self.slots.iter().enumerate() {
            if idx == UNASSIGNED {
                continue;
            }
            let slot = slot as u16;
            match ranges.last_mut() {
                Some(last) if last.end + 1 == slot && last.owner == self.owners[idx as usize] => {
                    last.end = slot;
                }
                _ => ranges.push(SlotRange {
                    start: slot,
                    end: slot,
                    owner: self.owners[idx as usize].clone(),
                }),
            }
        }
        ranges
    }
}
