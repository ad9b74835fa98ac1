//! # quorum
//!
//! why: majority arithmetic shared by elections and commit calculation
//! relations: used by node.rs for vote tallies, progress.rs for commit index
//! what: Configuration (voters, learners), VoteResult

use crate::error::{RaftError, Result};
use crate::{Index, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of counting votes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteResult {
    /// A quorum granted
    Won,
    /// A quorum can no longer grant
    Lost,
    /// Still waiting on responses
    Pending,
}

/// Fixed cluster membership: voters decide, learners only follow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    voters: BTreeSet<NodeId>,
    learners: BTreeSet<NodeId>,
}

impl Configuration {
    pub fn new(voters: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            voters: voters.into_iter().collect(),
            learners: BTreeSet::new(),
        }
    }

    pub fn with_learners(mut self, learners: impl IntoIterator<Item = NodeId>) -> Self {
        self.learners = learners.into_iter().collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.voters.is_empty() {
            return Err(RaftError::Config("configuration has no voters".into()));
        }
        if let Some(id) = self.voters.intersection(&self.learners).next() {
            return Err(RaftError::Config(format!(
                "node {id} is both voter and learner"
            )));
        }
        Ok(())
    }

    pub fn voters(&self) -> &BTreeSet<NodeId> {
        &self.voters
    }

    pub fn learners(&self) -> &BTreeSet<NodeId> {
        &self.learners
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.voters.contains(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.voters.contains(&id) || self.learners.contains(&id)
    }

    /// Every node that receives replication, voters first.
    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.voters.iter().chain(self.learners.iter()).copied()
    }

    /// floor(|voters| / 2) + 1
    pub fn quorum_size(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Highest index acknowledged by a quorum of voters, given each voter's
    /// match index (unknown voters count as 0).
    pub fn committed_index(&self, matched: impl Fn(NodeId) -> Option<Index>) -> Index {
        let mut indexes: Vec<Index> = self
            .voters
            .iter()
            .map(|id| matched(*id).unwrap_or(0))
            .collect();
        if indexes.is_empty() {
            return 0;
        }
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        indexes[self.quorum_size() - 1]
    }

    /// Tally granted (`true`) and rejected (`false`) votes; non-voters are
    /// ignored.
    pub fn vote_result(&self, votes: &BTreeMap<NodeId, bool>) -> VoteResult {
        let (mut granted, mut rejected) = (0, 0);
        for id in &self.voters {
            match votes.get(id) {
                Some(true) => granted += 1,
                Some(false) => rejected += 1,
                None => {}
            }
        }
        let quorum = self.quorum_size();
        if granted >= quorum {
            VoteResult::Won
        } else if self.voters.len() - rejected < quorum {
            VoteResult::Lost
        } else {
            VoteResult::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_sizes() {
        assert_eq!(Configuration::new([1]).quorum_size(), 1);
        assert_eq!(Configuration::new([1, 2, 3]).quorum_size(), 2);
        assert_eq!(Configuration::new([1, 2, 3, 4]).quorum_size(), 3);
        assert_eq!(Configuration::new([1, 2, 3, 4, 5]).quorum_size(), 3);
    }

    #[test]
    fn committed_index_is_quorum_th_largest_match() {
        let config = Configuration::new([1, 2, 3, 4, 5]);
        let matched: BTreeMap<NodeId, Index> =
            [(1, 9), (2, 7), (3, 7), (4, 2), (5, 1)].into_iter().collect();
        assert_eq!(config.committed_index(|id| matched.get(&id).copied()), 7);
    }

    #[test]
    fn learners_do_not_count_towards_commit() {
        let config = Configuration::new([1, 2, 3]).with_learners([4, 5]);
        let matched: BTreeMap<NodeId, Index> =
            [(1, 5), (2, 0), (3, 0), (4, 5), (5, 5)].into_iter().collect();
        assert_eq!(config.committed_index(|id| matched.get(&id).copied()), 0);
    }

    #[test]
    fn vote_results() {
        let config = Configuration::new([1, 2, 3]);
        let mut votes = BTreeMap::from([(1, true)]);
        assert_eq!(config.vote_result(&votes), VoteResult::Pending);
        votes.insert(2, false);
        assert_eq!(config.vote_result(&votes), VoteResult::Pending);
        votes.insert(3, false);
        assert_eq!(config.vote_result(&votes), VoteResult::Lost);

        let votes = BTreeMap::from([(1, true), (3, true)]);
        assert_eq!(config.vote_result(&votes), VoteResult::Won);
    }

    #[test]
    fn learner_votes_are_ignored() {
        let config = Configuration::new([1, 2, 3]).with_learners([4]);
        let votes = BTreeMap::from([(1, true), (4, true)]);
        assert_eq!(config.vote_result(&votes), VoteResult::Pending);
    }

    #[test]
    fn overlapping_sets_are_invalid() {
        let overlapping = Configuration::new([1, 2]).with_learners([2]);
        assert!(overlapping.validate().is_err());
        assert!(Configuration::new(Vec::<NodeId>::new()).validate().is_err());
        let disjoint = Configuration::new([1, 2, 3]).with_learners([4]);
        assert!(disjoint.validate().is_ok());
        assert!(disjoint.learners().contains(&4));
    }
}
