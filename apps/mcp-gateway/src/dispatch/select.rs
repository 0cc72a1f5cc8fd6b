use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Ready runner considered for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerCandidate {
    pub id: String,
    pub capacity: u32,
    pub load: u32,
}

impl RunnerCandidate {
    pub fn available(&self) -> bool {
        self.load < self.capacity
    }
}

/// Pick a runner with weighted rendezvous hashing over the session id, so
/// repeated dispatches of one session land on the same runner while it has
/// room. Full runners are skipped.
pub fn select_runner(session_id: &str, candidates: &[RunnerCandidate]) -> Option<RunnerCandidate> {
    let mut best: Option<(f64, &RunnerCandidate)> = None;
    for candidate in candidates.iter().filter(|c| c.available()) {
        let hash = hash64(&(session_id, &candidate.id));
        let weight = candidate.capacity.saturating_sub(candidate.load).max(1) as f64;
        let score = (hash as f64) * weight;
        if best.map(|(s, _)| score > s).unwrap_or(true) {
            best = Some((score, candidate));
        }
    }
    best.map(|(_, candidate)| candidate.clone())
}

fn hash64<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
