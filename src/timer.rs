//! One-shot timers for the event loop.
//!
//! The poller has no native timer support, so deadlines live in a binary
//! heap and the next one bounds the poll timeout. Entries are never
//! cancelled explicitly: a fired token is validated against the connection
//! arena like any other event, so a timer belonging to a destroyed
//! connection is simply skipped as stale.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    time::{Duration, Instant},
};

use mio::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deadline {
    at: Instant,
    token: Token,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Deadline) -> Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.token.0.cmp(&other.token.0))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Deadline) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    deadlines: BinaryHeap<Reverse<Deadline>>,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue {
            deadlines: BinaryHeap::new(),
        }
    }

    pub fn schedule(&mut self, delay: Duration, token: Token) {
        self.deadlines.push(Reverse(Deadline {
            at: Instant::now() + delay,
            token,
        }));
    }

    /// poll timeout that does not overshoot the earliest deadline
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.deadlines
            .peek()
            .map(|Reverse(d)| d.at.saturating_duration_since(now))
    }

    /// pop every deadline that has passed
    pub fn expired(&mut self, now: Instant) -> Vec<Token> {
        let mut fired = Vec::new();
        while let Some(Reverse(deadline)) = self.deadlines.peek() {
            if deadline.at > now {
                break;
            }
            fired.push(deadline.token);
            self.deadlines.pop();
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(Duration::from_millis(20), Token(2));
        timers.schedule(Duration::from_millis(10), Token(1));
        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(timers.expired(later), vec![Token(1), Token(2)]);
        assert!(timers.is_empty());
    }

    #[test]
    fn unexpired_deadlines_stay_queued() {
        let mut timers = TimerQueue::new();
        timers.schedule(Duration::from_secs(60), Token(7));
        assert!(timers.expired(Instant::now()).is_empty());
        let timeout = timers.next_timeout(Instant::now()).unwrap();
        assert!(timeout <= Duration::from_secs(60));
        assert!(timeout > Duration::from_secs(59));
    }
}
