use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Consulted once per cycle, right before changes are written.
pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Single-instance deployments: always allowed to write.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysLeader;

impl Leadership for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }
}

/// Leadership toggled from outside, e.g. by a lease watcher task.
#[derive(Debug, Clone, Default)]
pub struct LeaderFlag(Arc<AtomicBool>);

impl LeaderFlag {
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(AtomicBool::new(initial)))
    }

    pub fn set(&self, leader: bool) {
        self.0.store(leader, Ordering::SeqCst);
    }
}

impl Leadership for LeaderFlag {
    fn is_leader(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
