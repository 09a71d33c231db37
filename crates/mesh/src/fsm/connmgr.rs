//! The connection maker: keeps dialing the peers we want to be
//! connected to, with exponential backoff and jitter.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::net::time::Clock;
use crate::net::{LocalDuration, LocalTime};

use super::output::{Connect, SetTimer, Wire};
use super::peermgr::CONNECTION_TIMEOUT;

/// How often targets are examined.
pub const TICK_INTERVAL: LocalDuration = LocalDuration::from_secs(5);
/// First retry delay after a failure.
pub const BACKOFF_INITIAL: LocalDuration = LocalDuration::from_secs(5);
/// Retry delay cap.
pub const BACKOFF_MAX: LocalDuration = LocalDuration::from_mins(10);
/// Jitter applied to every backoff delay, in percent.
const JITTER_PERCENT: u64 = 20;

/// Where a target address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSource {
    /// Configured at startup.
    Initial,
    /// Learned from another peer's gossip.
    Gossip,
    /// Added through the control API.
    Api,
}

impl std::fmt::Display for TargetSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Gossip => write!(f, "gossip"),
            Self::Api => write!(f, "api"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    /// Eligible for an attempt on the next tick.
    Idle,
    /// A dial is in flight.
    Trying,
    /// Waiting out a retry delay.
    Backoff,
}

/// A peer address we keep trying to connect to.
#[derive(Debug, Clone)]
pub struct Target {
    pub state: TargetState,
    pub attempts: u32,
    pub next_attempt: LocalTime,
    pub source: TargetSource,
}

/// An event originating in the connection maker.
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection attempt is being made.
    Attempting(SocketAddr),
    /// An attempt failed; the target backs off.
    BackingOff {
        addr: SocketAddr,
        attempts: u32,
        delay: LocalDuration,
    },
    /// A target was added.
    TargetAdded(SocketAddr, TargetSource),
    /// A target was removed.
    TargetRemoved(SocketAddr),
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attempting(addr) => write!(fmt, "Attempting connection to {}", addr),
            Self::BackingOff {
                addr,
                attempts,
                delay,
            } => write!(
                fmt,
                "{}: attempt {} failed, retrying in {}",
                addr, attempts, delay
            ),
            Self::TargetAdded(addr, source) => {
                write!(fmt, "Added connection target {} from `{}`", addr, source)
            }
            Self::TargetRemoved(addr) => write!(fmt, "Removed connection target {}", addr),
        }
    }
}

/// Maintains the set of target peer addresses and the retry schedule.
#[derive(Debug)]
pub struct ConnectionMaker<U, C> {
    targets: HashMap<SocketAddr, Target>,
    /// Addresses that turned out to be ourselves. Never retried.
    poisoned: HashSet<SocketAddr>,
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<U: Wire<Event> + SetTimer + Connect, C: Clock> ConnectionMaker<U, C> {
    pub fn new(initial: Vec<SocketAddr>, rng: fastrand::Rng, upstream: U, clock: C) -> Self {
        let now = LocalTime::default();
        let targets = initial
            .into_iter()
            .map(|addr| {
                (
                    addr,
                    Target {
                        state: TargetState::Idle,
                        attempts: 0,
                        next_attempt: now,
                        source: TargetSource::Initial,
                    },
                )
            })
            .collect();

        Self {
            targets,
            poisoned: HashSet::new(),
            upstream,
            rng,
            clock,
        }
    }

    /// Must be called once. Schedules the first tick.
    pub fn initialize(&mut self) {
        self.upstream.set_timer(LocalDuration::from_secs(0));
    }

    /// Examine all targets; dial the ones that are due. `engaged`
    /// holds addresses the peer manager is already using, and
    /// `at_capacity` parks new attempts in backoff state.
    pub fn received_wake(&mut self, engaged: &HashSet<SocketAddr>, at_capacity: bool) {
        let now = self.clock.local_time();

        let due: Vec<SocketAddr> = self
            .targets
            .iter()
            .filter(|(addr, target)| {
                if engaged.contains(*addr) {
                    return false;
                }
                match target.state {
                    TargetState::Idle => true,
                    TargetState::Trying => false,
                    TargetState::Backoff => now >= target.next_attempt,
                }
            })
            .map(|(addr, _)| *addr)
            .collect();

        for addr in due {
            if at_capacity {
                // Over the connection limit, outbound attempts queue
                // up rather than dial.
                let target = self.targets.get_mut(&addr).expect("target is present");
                target.state = TargetState::Backoff;
                target.next_attempt = now + TICK_INTERVAL;
                continue;
            }
            let target = self.targets.get_mut(&addr).expect("target is present");
            target.state = TargetState::Trying;

            self.upstream.connect(addr, CONNECTION_TIMEOUT);
            self.upstream.event(Event::Attempting(addr));
        }

        self.upstream.set_timer(TICK_INTERVAL);
    }

    /// An attempt (or a live connection) to a target failed; double
    /// the retry delay, capped, with ±20% jitter.
    pub fn attempt_failed(&mut self, addr: &SocketAddr) {
        let now = self.clock.local_time();
        let Some(target) = self.targets.get_mut(addr) else {
            return;
        };

        target.attempts += 1;
        let exponent = target.attempts.saturating_sub(1).min(16);
        let base = (BACKOFF_INITIAL * 2u64.pow(exponent)).clamp(BACKOFF_INITIAL, BACKOFF_MAX);
        let jitter = self.rng.u64(100 - JITTER_PERCENT..=100 + JITTER_PERCENT);
        let delay = LocalDuration::from_millis(base.as_millis() * jitter / 100);

        target.state = TargetState::Backoff;
        target.next_attempt = now + delay;

        self.upstream.event(Event::BackingOff {
            addr: *addr,
            attempts: target.attempts,
            delay,
        });
        self.upstream.set_timer(delay);
    }

    /// A connection to a target completed its handshake.
    pub fn connection_established(&mut self, addr: &SocketAddr) {
        if let Some(target) = self.targets.get_mut(addr) {
            target.attempts = 0;
            target.state = TargetState::Idle;
        }
    }

    /// Add a target address. Duplicates and poisoned addresses are
    /// ignored.
    pub fn add_target(&mut self, addr: SocketAddr, source: TargetSource) -> bool {
        if self.poisoned.contains(&addr) || self.targets.contains_key(&addr) {
            return false;
        }
        self.targets.insert(
            addr,
            Target {
                state: TargetState::Idle,
                attempts: 0,
                next_attempt: self.clock.local_time(),
                source,
            },
        );
        self.upstream.event(Event::TargetAdded(addr, source));
        self.upstream.set_timer(LocalDuration::from_secs(1));
        true
    }

    /// Addresses learned from peer gossip become idle targets,
    /// attempted on the next tick.
    pub fn add_hints(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) {
        for addr in addrs {
            self.add_target(addr, TargetSource::Gossip);
        }
    }

    /// Stop trying to reach a target. A live connection to it is left
    /// to finish naturally.
    pub fn forget(&mut self, addr: &SocketAddr) {
        if self.targets.remove(addr).is_some() {
            self.upstream.event(Event::TargetRemoved(*addr));
        }
    }

    /// The address led back to ourselves; never dial it again.
    pub fn poison(&mut self, addr: SocketAddr) {
        self.targets.remove(&addr);
        self.poisoned.insert(addr);
    }

    pub fn is_target(&self, addr: &SocketAddr) -> bool {
        self.targets.contains_key(addr)
    }

    pub fn targets(&self) -> impl Iterator<Item = (&SocketAddr, &Target)> {
        self.targets.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::Outbox;
    use crate::net::time::RefClock;

    fn addr(port: u16) -> SocketAddr {
        ([10, 0, 0, 1], port).into()
    }

    fn maker(initial: Vec<SocketAddr>) -> (ConnectionMaker<Outbox, RefClock>, RefClock) {
        let clock = RefClock::from(LocalTime::from_secs(1_000));
        let rng = fastrand::Rng::with_seed(42);
        let maker = ConnectionMaker::new(initial, rng, Outbox::new(), clock.clone());
        (maker, clock)
    }

    #[test]
    fn initial_targets_dial_on_first_tick() {
        let (mut maker, _clock) = maker(vec![addr(7001), addr(7002)]);

        maker.received_wake(&HashSet::new(), false);

        let trying = maker
            .targets()
            .filter(|(_, t)| t.state == TargetState::Trying)
            .count();
        assert_eq!(trying, 2);
    }

    #[test]
    fn engaged_addresses_are_skipped() {
        let (mut maker, _clock) = maker(vec![addr(7001)]);

        let mut engaged = HashSet::new();
        engaged.insert(addr(7001));
        maker.received_wake(&engaged, false);

        assert_eq!(
            maker.targets().next().unwrap().1.state,
            TargetState::Idle
        );
    }

    #[test]
    fn backoff_respects_the_lower_bound() {
        // Invariant: after N failures, the delay before the next
        // attempt is at least min(initial * 2^(N-1), cap) * 0.8.
        let (mut maker, _clock) = maker(vec![addr(7001)]);

        for attempts in 1..=12u32 {
            maker.attempt_failed(&addr(7001));
            let target = maker.targets().next().unwrap().1;
            assert_eq!(target.attempts, attempts);

            let expected = (BACKOFF_INITIAL * 2u64.pow(attempts - 1))
                .clamp(BACKOFF_INITIAL, BACKOFF_MAX);
            let lower = expected.as_millis() * 80 / 100;
            let upper = expected.as_millis() * 120 / 100;

            let delay = target.next_attempt - LocalTime::from_secs(1_000);
            assert!(delay.as_millis() >= lower, "attempt {attempts}");
            assert!(delay.as_millis() <= upper, "attempt {attempts}");
        }
    }

    #[test]
    fn backoff_target_waits_for_its_deadline() {
        let (mut maker, clock) = maker(vec![addr(7001)]);

        maker.attempt_failed(&addr(7001));
        maker.received_wake(&HashSet::new(), false);
        assert_eq!(
            maker.targets().next().unwrap().1.state,
            TargetState::Backoff
        );

        clock.elapse(BACKOFF_INITIAL * 2);
        maker.received_wake(&HashSet::new(), false);
        assert_eq!(
            maker.targets().next().unwrap().1.state,
            TargetState::Trying
        );
    }

    #[test]
    fn success_resets_the_attempt_counter() {
        let (mut maker, _clock) = maker(vec![addr(7001)]);

        maker.attempt_failed(&addr(7001));
        maker.attempt_failed(&addr(7001));
        maker.connection_established(&addr(7001));

        let target = maker.targets().next().unwrap().1;
        assert_eq!(target.attempts, 0);
        assert_eq!(target.state, TargetState::Idle);
    }

    #[test]
    fn hints_dedupe_and_skip_poisoned() {
        let (mut maker, _clock) = maker(vec![]);

        maker.poison(addr(7001));
        maker.add_hints(vec![addr(7001), addr(7002), addr(7002)]);

        assert!(!maker.is_target(&addr(7001)));
        assert!(maker.is_target(&addr(7002)));
        assert_eq!(maker.targets().count(), 1);
    }

    #[test]
    fn forget_removes_the_target() {
        let (mut maker, _clock) = maker(vec![addr(7001)]);

        maker.forget(&addr(7001));
        assert!(!maker.is_target(&addr(7001)));

        // Forgotten targets can be re-added through the API.
        assert!(maker.add_target(addr(7001), TargetSource::Api));
    }

    #[test]
    fn at_capacity_attempts_queue_as_backoff() {
        let (mut maker, _clock) = maker(vec![addr(7001)]);

        maker.received_wake(&HashSet::new(), true);
        assert_eq!(
            maker.targets().next().unwrap().1.state,
            TargetState::Backoff
        );
    }
}
