// Scheduling Strategies
//
// Pure selection logic for the run queue. A strategy never touches a
// queue or a PCB; it only compares `Candidate` snapshots and reports which
// one should run next. The run queue builds the candidates and removes the
// winner.
//
// Strategies:
// - RoundRobin: global FIFO across every class (oldest enqueue first)
// - StrictPriority: highest non-empty class, FIFO inside the class
// - WeightedFair: smallest weighted virtual runtime
// - AdaptiveScore: largest wait * class_weight / (runtime + 1)
// - EarliestDeadlineFirst: smallest non-zero deadline among the two
//   real-time classes (REALTIME, HIGH); without one it behaves as RoundRobin
//
// Every strategy breaks ties with the enqueue sequence number, so equal
// candidates run in FIFO order.

use core::cmp::Ordering;

use crate::process::{Pid, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedAlgorithm {
    #[default]
    RoundRobin,
    StrictPriority,
    WeightedFair,
    AdaptiveScore,
    EarliestDeadlineFirst,
}

impl SchedAlgorithm {
    pub const ALL: [SchedAlgorithm; 5] = [
        SchedAlgorithm::RoundRobin,
        SchedAlgorithm::StrictPriority,
        SchedAlgorithm::WeightedFair,
        SchedAlgorithm::AdaptiveScore,
        SchedAlgorithm::EarliestDeadlineFirst,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            SchedAlgorithm::RoundRobin => "round-robin",
            SchedAlgorithm::StrictPriority => "strict-priority",
            SchedAlgorithm::WeightedFair => "weighted-fair",
            SchedAlgorithm::AdaptiveScore => "adaptive-score",
            SchedAlgorithm::EarliestDeadlineFirst => "earliest-deadline-first",
        }
    }
}

/// Snapshot of one queued process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub pid: Pid,
    pub priority: Priority,
    pub seq: u64,
    pub runtime: u64,
    pub vruntime: u64,
    pub last_run: u64,
    pub deadline: u64,
}

impl Candidate {
    /// wait * class_weight / (runtime + 1), widened so long waits never wrap.
    pub fn adaptive_score(&self, clock: u64) -> u128 {
        let wait = clock.saturating_sub(self.last_run) as u128;
        wait * self.priority.class_weight() as u128 / (self.runtime as u128 + 1)
    }

    fn has_deadline(&self) -> bool {
        self.priority.is_realtime_class() && self.deadline != 0
    }
}

/// `Less` means `a` should run before `b`.
fn order(algorithm: SchedAlgorithm, a: &Candidate, b: &Candidate, clock: u64) -> Ordering {
    let primary = match algorithm {
        SchedAlgorithm::RoundRobin => Ordering::Equal,
        SchedAlgorithm::StrictPriority => b.priority.cmp(&a.priority),
        SchedAlgorithm::WeightedFair => a.vruntime.cmp(&b.vruntime),
        SchedAlgorithm::AdaptiveScore => b.adaptive_score(clock).cmp(&a.adaptive_score(clock)),
        SchedAlgorithm::EarliestDeadlineFirst => match (a.has_deadline(), b.has_deadline()) {
            (true, true) => a.deadline.cmp(&b.deadline),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => Ordering::Equal,
        },
    };
    primary.then(a.seq.cmp(&b.seq))
}

pub fn select<I>(algorithm: SchedAlgorithm, candidates: I, clock: u64) -> Option<Candidate>
where
    I: IntoIterator<Item = Candidate>,
{
    candidates
        .into_iter()
        .min_by(|a, b| order(algorithm, a, b, clock))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(pid: u32, priority: Priority, seq: u64) -> Candidate {
        Candidate {
            pid: Pid::from_raw(pid),
            priority,
            seq,
            runtime: 0,
            vruntime: 0,
            last_run: 0,
            deadline: 0,
        }
    }

    fn pick(algorithm: SchedAlgorithm, candidates: &[Candidate], clock: u64) -> u32 {
        select(algorithm, candidates.iter().copied(), clock)
            .unwrap()
            .pid
            .raw()
    }

    #[test]
    fn empty_set_selects_nothing() {
        for algorithm in SchedAlgorithm::ALL {
            assert!(select(algorithm, core::iter::empty(), 0).is_none());
        }
    }

    #[test]
    fn round_robin_ignores_class() {
        let set = [
            candidate(1, Priority::Realtime, 5),
            candidate(2, Priority::Idle, 3),
            candidate(3, Priority::Normal, 4),
        ];
        assert_eq!(pick(SchedAlgorithm::RoundRobin, &set, 0), 2);
    }

    #[test]
    fn strict_priority_prefers_class_then_fifo() {
        let set = [
            candidate(1, Priority::Normal, 1),
            candidate(2, Priority::High, 7),
            candidate(3, Priority::High, 4),
        ];
        assert_eq!(pick(SchedAlgorithm::StrictPriority, &set, 0), 3);
    }

    #[test]
    fn weighted_fair_picks_smallest_vruntime() {
        let mut a = candidate(1, Priority::Normal, 1);
        let mut b = candidate(2, Priority::Normal, 2);
        a.vruntime = 500;
        b.vruntime = 200;
        assert_eq!(pick(SchedAlgorithm::WeightedFair, &[a, b], 0), 2);

        b.vruntime = 500;
        assert_eq!(pick(SchedAlgorithm::WeightedFair, &[b, a], 0), 1);
    }

    #[test]
    fn adaptive_score_favors_long_waiters() {
        let mut busy = candidate(1, Priority::Normal, 1);
        busy.runtime = 100;
        busy.last_run = 90;
        let mut starved = candidate(2, Priority::Normal, 2);
        starved.runtime = 1;
        starved.last_run = 10;

        assert_eq!(busy.adaptive_score(100), 10 * 1024 / 101);
        assert_eq!(starved.adaptive_score(100), 90 * 1024 / 2);
        assert_eq!(pick(SchedAlgorithm::AdaptiveScore, &[busy, starved], 100), 2);
    }

    #[test]
    fn edf_picks_nearest_realtime_deadline() {
        let mut far = candidate(1, Priority::Realtime, 1);
        far.deadline = 900;
        let mut near = candidate(2, Priority::High, 2);
        near.deadline = 300;
        // A deadline on a non real-time class is ignored.
        let mut normal = candidate(3, Priority::Normal, 0);
        normal.deadline = 100;

        assert_eq!(
            pick(SchedAlgorithm::EarliestDeadlineFirst, &[far, normal, near], 0),
            2
        );
    }

    #[test]
    fn edf_without_deadlines_falls_back_to_fifo() {
        let set = [
            candidate(1, Priority::Realtime, 9),
            candidate(2, Priority::Low, 2),
        ];
        assert_eq!(pick(SchedAlgorithm::EarliestDeadlineFirst, &set, 0), 2);
    }
}
