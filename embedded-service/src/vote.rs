//! Multi-client constraint arbitration
//!
//! A [`Votable`] collects requests ("votes") from a closed set of clients for a single
//! scalar resource and elects one effective value according to a [`VoteKind`]. Whenever
//! the effective value or the client holding it changes, the caller supplied [`Elector`]
//! is invoked so the new value can be applied to hardware.
//!
//! The elector is invoked with the election lock held. An elector must therefore never
//! vote on the same votable it is being called for, doing so will deadlock.
use core::cell::RefCell;
use core::future::Future;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use heapless::Vec;

use crate::{trace, warn};

/// Aggregation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VoteKind {
    /// Effective value is the smallest enabled vote
    Min,
    /// Effective value is the largest enabled vote
    Max,
    /// Effective value is the most recently enabled vote
    SetAny,
}

/// Votable errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VoteError {
    /// No room left for another client
    TooManyClients,
}

/// Result of an election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Election<C> {
    /// Effective value, `None` if nobody has an enabled vote
    pub value: Option<i32>,
    /// Client holding the effective value, `None` for overrides, forced values and empty ballots
    pub client: Option<C>,
    /// Whether the new value may be applied gradually
    pub step: bool,
}

/// Applies an election result
pub trait Elector<C> {
    /// Error returned when the result could not be applied
    type Error;

    /// Called when the effective value changes or an election is rerun
    fn elected(&self, election: Election<C>) -> impl Future<Output = Result<(), Self::Error>>;
}

#[derive(Debug, Clone, Copy)]
struct Vote<C> {
    client: C,
    enabled: bool,
    value: i32,
    /// Sequence number of the last enabling write
    seq: u32,
}

struct Ballot<C, const N: usize> {
    votes: Vec<Vote<C>, N>,
    seq: u32,
    overridden: Option<i32>,
    forced: Option<i32>,
    /// Last published result, `None` until the first election
    published: Option<(Option<i32>, Option<C>)>,
}

impl<C: Copy + Eq, const N: usize> Ballot<C, N> {
    const fn new() -> Self {
        Self {
            votes: Vec::new(),
            seq: 0,
            overridden: None,
            forced: None,
            published: None,
        }
    }

    fn find(&self, client: C) -> Option<&Vote<C>> {
        self.votes.iter().find(|v| v.client == client)
    }

    /// Compute the winner among enabled votes, optionally ignoring one client
    fn winner(&self, kind: VoteKind, exclude: Option<C>) -> Option<(i32, C)> {
        let mut best: Option<&Vote<C>> = None;
        for vote in self
            .votes
            .iter()
            .filter(|v| v.enabled && Some(v.client) != exclude)
        {
            best = match best {
                None => Some(vote),
                Some(current) => {
                    let better = match kind {
                        VoteKind::Min => vote.value < current.value,
                        VoteKind::Max => vote.value > current.value,
                        VoteKind::SetAny => vote.seq > current.seq,
                    };
                    if better {
                        Some(vote)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        best.map(|v| (v.value, v.client))
    }

    fn effective(&self, kind: VoteKind) -> (Option<i32>, Option<C>) {
        if let Some(forced) = self.forced {
            return (Some(forced), None);
        }
        if let Some(value) = self.overridden {
            return (Some(value), None);
        }
        match self.winner(kind, None) {
            Some((value, client)) => (Some(value), Some(client)),
            None => (None, None),
        }
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }
}

/// A single arbitrated resource
pub struct Votable<M: RawMutex, C, const N: usize> {
    name: &'static str,
    kind: VoteKind,
    /// Serializes mutation and the elector call
    election: Mutex<M, ()>,
    ballot: BlockingMutex<M, RefCell<Ballot<C, N>>>,
}

impl<M: RawMutex, C: Copy + Eq, const N: usize> Votable<M, C, N> {
    /// Create a new votable
    pub const fn new(name: &'static str, kind: VoteKind) -> Self {
        Self {
            name,
            kind,
            election: Mutex::new(()),
            ballot: BlockingMutex::new(RefCell::new(Ballot::new())),
        }
    }

    /// Votable name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Aggregation policy
    pub fn kind(&self) -> VoteKind {
        self.kind
    }

    /// Cast, update or withdraw a vote
    ///
    /// Withdrawing (`enabled == false`) removes the vote from consideration, the value is ignored.
    pub async fn vote<E: Elector<C>>(
        &self,
        elector: &E,
        client: C,
        enabled: bool,
        value: i32,
        step: bool,
    ) -> Result<(), VoteError> {
        let _guard = self.election.lock().await;

        let unchanged = self.ballot.lock(|ballot| -> Result<bool, VoteError> {
            let mut ballot = ballot.borrow_mut();
            let first = ballot.published.is_none();
            let seq = ballot.next_seq();
            let index = ballot.votes.iter().position(|v| v.client == client);
            match index {
                Some(index) => {
                    let vote = &mut ballot.votes[index];
                    let similar = vote.enabled == enabled && (!enabled || vote.value == value);
                    if similar && !first {
                        return Ok(true);
                    }
                    if enabled {
                        vote.value = value;
                        vote.seq = seq;
                    }
                    vote.enabled = enabled;
                    Ok(false)
                }
                None => {
                    if !enabled && !first {
                        return Ok(true);
                    }
                    ballot
                        .votes
                        .push(Vote {
                            client,
                            enabled,
                            value,
                            seq,
                        })
                        .map_err(|_| VoteError::TooManyClients)?;
                    Ok(false)
                }
            }
        })?;

        if unchanged {
            trace!("{}: similar vote ignored", self.name);
            return Ok(());
        }

        self.elect(elector, step, false).await;
        Ok(())
    }

    /// Set or clear a value that supersedes the aggregation policy
    pub async fn override_vote<E: Elector<C>>(&self, elector: &E, enabled: bool, value: i32, step: bool) {
        let _guard = self.election.lock().await;
        self.ballot
            .lock(|ballot| ballot.borrow_mut().overridden = enabled.then_some(value));
        self.elect(elector, step, false).await;
    }

    /// Force a value regardless of votes and overrides, used for debugging
    pub async fn force<E: Elector<C>>(&self, elector: &E, value: Option<i32>) {
        let _guard = self.election.lock().await;
        self.ballot.lock(|ballot| ballot.borrow_mut().forced = value);
        self.elect(elector, false, false).await;
    }

    /// Recompute the result and call the elector even if nothing changed
    pub async fn rerun_election<E: Elector<C>>(&self, elector: &E, step: bool) {
        let _guard = self.election.lock().await;
        self.elect(elector, step, true).await;
    }

    async fn elect<E: Elector<C>>(&self, elector: &E, step: bool, always: bool) {
        let (changed, value, client) = self.ballot.lock(|ballot| {
            let mut ballot = ballot.borrow_mut();
            let (value, client) = ballot.effective(self.kind);
            let changed = ballot.published != Some((value, client));
            ballot.published = Some((value, client));
            (changed, value, client)
        });

        if !changed && !always {
            return;
        }

        trace!("{}: elected {:?}", self.name, value);
        if elector.elected(Election { value, client, step }).await.is_err() {
            // The ballot stays authoritative, the next election retries
            warn!("{}: failed to apply {:?}", self.name, value);
        }
    }

    /// Current effective value
    pub fn effective_result(&self) -> Option<i32> {
        self.ballot.lock(|ballot| ballot.borrow().effective(self.kind).0)
    }

    /// Client holding the current effective value
    pub fn effective_client(&self) -> Option<C> {
        self.ballot.lock(|ballot| ballot.borrow().effective(self.kind).1)
    }

    /// Effective value as if `client` had not voted, ignores overrides and forced values
    pub fn effective_result_excluding(&self, client: C) -> Option<i32> {
        self.ballot
            .lock(|ballot| ballot.borrow().winner(self.kind, Some(client)).map(|(v, _)| v))
    }

    /// Returns true if `client` currently has an enabled vote
    pub fn is_client_enabled(&self, client: C) -> bool {
        self.ballot
            .lock(|ballot| ballot.borrow().find(client).is_some_and(|v| v.enabled))
    }

    /// Value voted by `client`, `None` if the vote is not enabled
    pub fn client_vote(&self, client: C) -> Option<i32> {
        self.ballot.lock(|ballot| {
            ballot
                .borrow()
                .find(client)
                .filter(|v| v.enabled)
                .map(|v| v.value)
        })
    }

    /// Returns true if the effective value is set and non-zero, for enable/disable votables
    pub fn is_set(&self) -> bool {
        self.effective_result().is_some_and(|v| v != 0)
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use core::cell::RefCell;
    use std::vec::Vec;

    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Client {
        A,
        B,
        C,
    }

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<Election<Client>>>,
        fail: bool,
    }

    impl Elector<Client> for Recorder {
        type Error = ();

        async fn elected(&self, election: Election<Client>) -> Result<(), ()> {
            self.calls.borrow_mut().push(election);
            if self.fail {
                Err(())
            } else {
                Ok(())
            }
        }
    }

    type TestVotable = Votable<NoopRawMutex, Client, 4>;

    #[test]
    fn test_min_disable_raises_result() {
        let votable = TestVotable::new("fcc", VoteKind::Min);
        let rec = Recorder::default();
        block_on(async {
            votable.vote(&rec, Client::A, true, 500, false).await.unwrap();
            votable.vote(&rec, Client::B, true, 300, false).await.unwrap();
            assert_eq!(votable.effective_result(), Some(300));
            assert_eq!(votable.effective_client(), Some(Client::B));

            votable.vote(&rec, Client::B, false, 0, false).await.unwrap();
            assert_eq!(votable.effective_result(), Some(500));
            assert_eq!(votable.effective_client(), Some(Client::A));
        });

        let calls = rec.calls.borrow();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].value, Some(500));
    }

    #[test]
    fn test_min_matches_smallest_enabled() {
        let votable = TestVotable::new("icl", VoteKind::Min);
        let rec = Recorder::default();
        let sets: [[(bool, i32); 3]; 4] = [
            [(true, 100), (true, 200), (true, 50)],
            [(false, 10), (true, 200), (true, 900)],
            [(true, 7), (false, 1), (false, 1)],
            [(true, 300), (true, 300), (true, 301)],
        ];
        block_on(async {
            for set in sets {
                for (client, (enabled, value)) in [Client::A, Client::B, Client::C].into_iter().zip(set) {
                    votable.vote(&rec, client, enabled, value, false).await.unwrap();
                }
                let expected = set.iter().filter(|(e, _)| *e).map(|(_, v)| *v).min();
                assert_eq!(votable.effective_result(), expected);
            }
        });
    }

    #[test]
    fn test_min_tie_prefers_first_registered() {
        let votable = TestVotable::new("icl", VoteKind::Min);
        let rec = Recorder::default();
        block_on(async {
            votable.vote(&rec, Client::C, true, 100, false).await.unwrap();
            votable.vote(&rec, Client::A, true, 100, false).await.unwrap();
        });
        assert_eq!(votable.effective_client(), Some(Client::C));
    }

    #[test]
    fn test_max() {
        let votable = TestVotable::new("comu", VoteKind::Max);
        let rec = Recorder::default();
        block_on(async {
            votable.vote(&rec, Client::A, true, 1, false).await.unwrap();
            votable.vote(&rec, Client::B, true, 3, false).await.unwrap();
            assert_eq!(votable.effective_result(), Some(3));
            votable.vote(&rec, Client::B, false, 0, false).await.unwrap();
            assert_eq!(votable.effective_result(), Some(1));
        });
    }

    #[test]
    fn test_set_any_most_recent_wins() {
        let votable = TestVotable::new("disable", VoteKind::SetAny);
        let rec = Recorder::default();
        block_on(async {
            votable.vote(&rec, Client::A, true, 1, false).await.unwrap();
            votable.vote(&rec, Client::B, true, 0, false).await.unwrap();
            votable.vote(&rec, Client::C, true, 2, false).await.unwrap();
            assert_eq!(votable.effective_result(), Some(2));

            // Disabling the latest falls back to the next most recent
            votable.vote(&rec, Client::C, false, 0, false).await.unwrap();
            assert_eq!(votable.effective_result(), Some(0));
            assert_eq!(votable.effective_client(), Some(Client::B));

            // Re-enabling makes a vote the most recent again
            votable.vote(&rec, Client::A, false, 0, false).await.unwrap();
            votable.vote(&rec, Client::A, true, 1, false).await.unwrap();
            assert_eq!(votable.effective_client(), Some(Client::A));

            votable.vote(&rec, Client::A, false, 0, false).await.unwrap();
            votable.vote(&rec, Client::B, false, 0, false).await.unwrap();
            assert_eq!(votable.effective_result(), None);
            assert!(!votable.is_set());
        });
    }

    #[test]
    fn test_similar_vote_ignored() {
        let votable = TestVotable::new("fcc", VoteKind::Min);
        let rec = Recorder::default();
        block_on(async {
            votable.vote(&rec, Client::A, true, 500, false).await.unwrap();
            votable.vote(&rec, Client::A, true, 500, false).await.unwrap();
            votable.vote(&rec, Client::B, false, 0, false).await.unwrap();
        });
        assert_eq!(rec.calls.borrow().len(), 1);
    }

    #[test]
    fn test_rerun_always_calls() {
        let votable = TestVotable::new("fcc", VoteKind::Min);
        let rec = Recorder::default();
        block_on(async {
            votable.vote(&rec, Client::A, true, 500, false).await.unwrap();
            votable.rerun_election(&rec, true).await;
        });
        let calls = rec.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].value, Some(500));
        assert!(calls[1].step);
    }

    #[test]
    fn test_callback_error_keeps_result() {
        let votable = TestVotable::new("fcc", VoteKind::Min);
        let rec = Recorder {
            fail: true,
            ..Default::default()
        };
        block_on(async {
            votable.vote(&rec, Client::A, true, 500, false).await.unwrap();
        });
        assert_eq!(votable.effective_result(), Some(500));
    }

    #[test]
    fn test_override_and_force() {
        let votable = TestVotable::new("fcc", VoteKind::Min);
        let rec = Recorder::default();
        block_on(async {
            votable.vote(&rec, Client::A, true, 500, false).await.unwrap();
            votable.override_vote(&rec, true, 1000, false).await;
            assert_eq!(votable.effective_result(), Some(1000));
            assert_eq!(votable.effective_client(), None);

            votable.force(&rec, Some(42)).await;
            assert_eq!(votable.effective_result(), Some(42));
            votable.force(&rec, None).await;
            votable.override_vote(&rec, false, 0, false).await;
            assert_eq!(votable.effective_result(), Some(500));
        });
    }

    #[test]
    fn test_queries() {
        let votable = TestVotable::new("fcc", VoteKind::Min);
        let rec = Recorder::default();
        block_on(async {
            votable.vote(&rec, Client::A, true, 500, false).await.unwrap();
            votable.vote(&rec, Client::B, true, 300, false).await.unwrap();
            votable.vote(&rec, Client::C, false, 100, false).await.unwrap();
        });
        assert!(votable.is_client_enabled(Client::A));
        assert!(!votable.is_client_enabled(Client::C));
        assert_eq!(votable.client_vote(Client::C), None);
        assert_eq!(votable.client_vote(Client::B), Some(300));
        assert_eq!(votable.effective_result_excluding(Client::B), Some(500));
    }

    #[test]
    fn test_too_many_clients() {
        let votable = Votable::<NoopRawMutex, Client, 2>::new("fcc", VoteKind::Min);
        let rec = Recorder::default();
        block_on(async {
            votable.vote(&rec, Client::A, true, 1, false).await.unwrap();
            votable.vote(&rec, Client::B, true, 2, false).await.unwrap();
            assert_eq!(
                votable.vote(&rec, Client::C, true, 3, false).await,
                Err(VoteError::TooManyClients)
            );
        });
    }
}
