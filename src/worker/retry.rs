//! Peer selection for a single request that may have to be retried.

use crate::protocol::tracker::PeerAddr;

/// Result of the last attempt made through a [`PeerRotation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing tried yet.
    Start,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    TryPeer(PeerAddr),
    Done,
    /// Every candidate failed; wait and refresh the candidate list.
    BackOff,
}

/// Walks a candidate list without replacement.
///
/// Feed the outcome of each attempt back into [`PeerRotation::next`]; after
/// a success the rotation is done, after the last failure it asks for a
/// backoff. The caller owns all I/O and sleeping.
#[derive(Debug, Clone)]
pub struct PeerRotation {
    candidates: std::vec::IntoIter<PeerAddr>,
}

impl PeerRotation {
    /// `candidates` should already be shuffled.
    pub fn new(candidates: Vec<PeerAddr>) -> Self {
        Self {
            candidates: candidates.into_iter(),
        }
    }

    pub fn next(&mut self, last: Outcome) -> NextAction {
        if last == Outcome::Succeeded {
            return NextAction::Done;
        }
        match self.candidates.next() {
            Some(peer) => NextAction::TryPeer(peer),
            None => NextAction::BackOff,
        }
    }

    pub fn remaining(&self) -> usize {
        self.candidates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: u16) -> Vec<PeerAddr> {
        (0..n).map(|i| PeerAddr::new("10.0.0.1", 9000 + i)).collect()
    }

    #[test]
    fn tries_each_candidate_once_then_backs_off() {
        let mut rotation = PeerRotation::new(peers(3));
        let mut tried = Vec::new();
        let mut outcome = Outcome::Start;
        loop {
            match rotation.next(outcome) {
                NextAction::TryPeer(peer) => {
                    tried.push(peer);
                    outcome = Outcome::Failed;
                }
                NextAction::BackOff => break,
                NextAction::Done => panic!("nothing succeeded"),
            }
        }
        assert_eq!(tried, peers(3));
        assert_eq!(rotation.remaining(), 0);
    }

    #[test]
    fn success_ends_rotation() {
        let mut rotation = PeerRotation::new(peers(3));
        assert!(matches!(rotation.next(Outcome::Start), NextAction::TryPeer(_)));
        assert_eq!(rotation.next(Outcome::Succeeded), NextAction::Done);
        assert_eq!(rotation.remaining(), 2);
    }

    #[test]
    fn empty_list_backs_off_immediately() {
        let mut rotation = PeerRotation::new(Vec::new());
        assert_eq!(rotation.next(Outcome::Start), NextAction::BackOff);
    }
}
