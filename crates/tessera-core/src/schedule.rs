//! Randomized vote schedule generation.
//!
//! Two independent randomizations go into a schedule: the vote order is
//! shuffled so arrival order cannot be correlated with the tickets' original
//! (chain-derived) ordering, and dispatch times are drawn uniformly over the
//! target window so submissions from one address do not cluster.

use std::time::Duration;

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::api::CastVote;

/// Minimum voting window the scheduler will spread votes over. Doubles as
/// the safety margin kept before the window's end.
pub const MIN_VOTE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Scheduling errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// No eligible votes were supplied.
    #[error("no votes to schedule")]
    NoVotes,

    /// The remaining voting window is under one hour. The operator can still
    /// vote by setting a duration manually.
    #[error("less than one hour left to vote, set --vote-duration manually")]
    WindowTooShort,
}

/// A scheduled unit of work: one signed vote and the delay from the previous
/// dispatch. Consumed at most once by the engine's interval queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteInterval {
    /// The signed vote.
    pub vote: CastVote,
    /// Delay from the prior dispatch.
    #[serde(with = "humantime_serde")]
    pub at: Duration,
}

/// Derive the trickle duration from chain state: the time left until the
/// vote's end block, minus a one-hour safety margin.
///
/// # Errors
///
/// [`ScheduleError::WindowTooShort`] when fewer blocks remain than one hour
/// of chain time.
pub fn vote_duration(
    block_time: Duration,
    end_height: u32,
    best_block: u32,
    blocks_per_hour: u32,
) -> Result<Duration, ScheduleError> {
    let blocks_left = end_height.saturating_sub(best_block);
    if blocks_left < blocks_per_hour {
        return Err(ScheduleError::WindowTooShort);
    }
    Ok(block_time * (blocks_left - blocks_per_hour))
}

/// Produce a randomized schedule: shuffle the votes, draw one uniform sample
/// from `[0, duration]` per vote, sort the samples, and emit them as
/// inter-arrival deltas. The delays sum to at most `duration`; zero-delay
/// intervals are possible and dispatched immediately.
///
/// # Errors
///
/// [`ScheduleError::NoVotes`] on an empty vote set,
/// [`ScheduleError::WindowTooShort`] when `duration` is under one hour.
pub fn trickle_schedule<R: Rng>(
    mut votes: Vec<CastVote>,
    duration: Duration,
    rng: &mut R,
) -> Result<Vec<VoteInterval>, ScheduleError> {
    if votes.is_empty() {
        return Err(ScheduleError::NoVotes);
    }
    if duration < MIN_VOTE_WINDOW {
        return Err(ScheduleError::WindowTooShort);
    }

    votes.shuffle(rng);

    let mut offsets: Vec<Duration> = votes
        .iter()
        .map(|_| rng.gen_range(Duration::ZERO..=duration))
        .collect();
    offsets.sort_unstable();

    let mut previous = Duration::ZERO;
    let schedule = votes
        .into_iter()
        .zip(offsets)
        .map(|(vote, offset)| {
            let at = offset - previous;
            previous = offset;
            VoteInterval { vote, at }
        })
        .collect();
    Ok(schedule)
}

/// Seed a deterministic scheduler RNG. Callers without a fixed seed use
/// [`generate_seed`].
#[must_use]
pub fn seeded_rng(seed: u64) -> rand::rngs::StdRng {
    rand::rngs::StdRng::seed_from_u64(seed)
}

/// Draw a schedule seed from OS entropy.
#[must_use]
pub fn generate_seed() -> u64 {
    OsRng.next_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(n: usize) -> CastVote {
        CastVote {
            token: "aa".repeat(16),
            ticket: format!("{n:064x}"),
            vote_bit: "1".to_string(),
            signature: "cc".repeat(32),
        }
    }

    #[test]
    fn schedule_covers_every_vote_within_the_window() {
        let duration = Duration::from_secs(2 * 3600);
        let votes: Vec<_> = (0..50).map(vote).collect();
        let mut rng = seeded_rng(1);

        let schedule = trickle_schedule(votes, duration, &mut rng).expect("schedule");

        assert_eq!(schedule.len(), 50);
        let total: Duration = schedule.iter().map(|interval| interval.at).sum();
        assert!(total <= duration, "delays sum past the window: {total:?}");
        assert!(total > Duration::ZERO);
    }

    #[test]
    fn schedule_is_deterministic_for_a_seed() {
        let duration = Duration::from_secs(3 * 3600);
        let votes: Vec<_> = (0..10).map(vote).collect();

        let first =
            trickle_schedule(votes.clone(), duration, &mut seeded_rng(7)).expect("schedule");
        let second = trickle_schedule(votes, duration, &mut seeded_rng(7)).expect("schedule");

        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.vote.ticket, b.vote.ticket);
            assert_eq!(a.at, b.at);
        }
    }

    #[test]
    fn schedule_reorders_votes() {
        let duration = Duration::from_secs(2 * 3600);
        let votes: Vec<_> = (0..100).map(vote).collect();
        let original: Vec<_> = votes.iter().map(|v| v.ticket.clone()).collect();

        let schedule = trickle_schedule(votes, duration, &mut seeded_rng(3)).expect("schedule");
        let shuffled: Vec<_> = schedule.iter().map(|i| i.vote.ticket.clone()).collect();

        assert_ne!(original, shuffled);
        let mut sorted_original = original;
        let mut sorted_shuffled = shuffled;
        sorted_original.sort();
        sorted_shuffled.sort();
        assert_eq!(sorted_original, sorted_shuffled);
    }

    #[test]
    fn short_window_is_rejected() {
        let votes = vec![vote(0)];
        let result = trickle_schedule(votes, Duration::from_secs(1800), &mut seeded_rng(1));
        assert!(matches!(result, Err(ScheduleError::WindowTooShort)));
    }

    #[test]
    fn empty_vote_set_is_rejected() {
        let result = trickle_schedule(Vec::new(), Duration::from_secs(7200), &mut seeded_rng(1));
        assert!(matches!(result, Err(ScheduleError::NoVotes)));
    }

    #[test]
    fn duration_derivation_keeps_an_hour_of_margin() {
        let block_time = Duration::from_secs(300);
        // 36 blocks left, 12 per hour: 24 blocks of schedulable time.
        let duration = vote_duration(block_time, 1036, 1000, 12).expect("duration");
        assert_eq!(duration, Duration::from_secs(24 * 300));

        let short = vote_duration(block_time, 1010, 1000, 12);
        assert!(matches!(short, Err(ScheduleError::WindowTooShort)));
    }
}
