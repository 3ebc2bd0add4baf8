use crate::clock::deadline_reached;
use crate::notify::Notice;
use crate::types::RefreshPhase;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: Option<i64>,
    pub display: String,
}

impl Requester {
    pub fn system(reason: &str) -> Self {
        Self {
            id: None,
            display: reason.to_string(),
        }
    }

    pub fn user(id: i64, display: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            display: display.into(),
        }
    }

    pub fn is_user(&self) -> bool {
        self.id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Queued,
    AlreadyInProgress,
    AlreadyPending,
    CoolingDown,
}

impl RequestOutcome {
    pub fn is_queued(self) -> bool {
        self == Self::Queued
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::AlreadyInProgress => "in_progress",
            Self::AlreadyPending => "pending",
            Self::CoolingDown => "cooling_down",
        }
    }
}

/// Token for a refresh that has started. Handing it back to
/// [`RefreshWorker::finish`] is the only way back to idle.
#[derive(Debug)]
#[must_use]
pub struct RefreshJob {
    pub requester: Requester,
}

impl RefreshJob {
    pub fn started_notice(&self) -> Notice {
        Notice::new(format!("🔄 Güncelleme başladı ({})", self.requester.display))
    }
}

/// Single-flight gate for calendar refreshes. Requests only mark the work as
/// pending; the tick loop picks it up with [`RefreshWorker::begin`].
#[derive(Debug, Clone)]
pub struct RefreshWorker {
    cooldown_ms: u32,
    pending: bool,
    in_progress: bool,
    cooldown_until_ms: Option<u32>,
    requester: Option<Requester>,
}

impl RefreshWorker {
    pub fn new(cooldown_ms: u32) -> Self {
        Self {
            cooldown_ms,
            pending: false,
            in_progress: false,
            cooldown_until_ms: None,
            requester: None,
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        if self.in_progress {
            RefreshPhase::InProgress
        } else if self.pending {
            RefreshPhase::Pending
        } else {
            RefreshPhase::Idle
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn request(&mut self, requester: Requester, now_ms: u32) -> RequestOutcome {
        self.expire_cooldown(now_ms);
        if self.in_progress {
            return RequestOutcome::AlreadyInProgress;
        }
        if self.pending {
            return RequestOutcome::AlreadyPending;
        }
        if self.cooling_down(now_ms) {
            return RequestOutcome::CoolingDown;
        }

        self.pending = true;
        self.requester = Some(requester);
        RequestOutcome::Queued
    }

    /// Moves a pending request to in-progress and starts the cooldown.
    pub fn begin(&mut self, now_ms: u32, connected: bool) -> Option<RefreshJob> {
        self.expire_cooldown(now_ms);
        if !self.pending || self.in_progress || !connected || self.cooling_down(now_ms) {
            return None;
        }

        self.pending = false;
        self.in_progress = true;
        self.cooldown_until_ms = Some(now_ms.wrapping_add(self.cooldown_ms));
        let requester = self
            .requester
            .take()
            .unwrap_or_else(|| Requester::system("refresh"));
        Some(RefreshJob { requester })
    }

    pub fn finish(&mut self, job: RefreshJob) -> Requester {
        self.in_progress = false;
        job.requester
    }

    fn cooling_down(&self, now_ms: u32) -> bool {
        self.cooldown_until_ms
            .is_some_and(|until| !deadline_reached(now_ms, until))
    }

    // Dropped once reached so a long idle period cannot wrap the counter back
    // into the cooldown range.
    fn expire_cooldown(&mut self, now_ms: u32) {
        if self
            .cooldown_until_ms
            .is_some_and(|until| deadline_reached(now_ms, until))
        {
            self.cooldown_until_ms = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn alice() -> Requester {
        Requester::user(7, "alice")
    }

    #[test]
    fn back_to_back_requests_run_once() {
        let mut worker = RefreshWorker::new(60_000);

        assert_eq!(worker.request(alice(), 0), RequestOutcome::Queued);
        assert_eq!(worker.request(alice(), 10), RequestOutcome::AlreadyPending);
        assert_eq!(worker.phase(), RefreshPhase::Pending);

        let job = worker.begin(20, true).unwrap();
        assert_eq!(job.requester, alice());
        assert!(worker.begin(30, true).is_none());
        assert_eq!(worker.request(alice(), 40), RequestOutcome::AlreadyInProgress);

        let requester = worker.finish(job);
        assert_eq!(requester.id, Some(7));
        assert_eq!(worker.phase(), RefreshPhase::Idle);
    }

    #[test]
    fn waits_for_connectivity() {
        let mut worker = RefreshWorker::new(60_000);
        worker.request(Requester::system("boot"), 0);

        assert!(worker.begin(100, false).is_none());
        assert_eq!(worker.phase(), RefreshPhase::Pending);
        assert!(worker.begin(200, true).is_some());
    }

    #[test]
    fn cooldown_blocks_new_requests_after_start() {
        let mut worker = RefreshWorker::new(60_000);
        worker.request(alice(), 1_000);
        let job = worker.begin(1_000, true).unwrap();
        let _ = worker.finish(job);

        assert_eq!(worker.request(alice(), 30_000), RequestOutcome::CoolingDown);
        assert_eq!(worker.request(alice(), 61_000), RequestOutcome::Queued);
    }

    #[test]
    fn cooldown_handles_counter_wraparound() {
        let mut worker = RefreshWorker::new(60_000);
        let start = u32::MAX - 1_000;
        worker.request(alice(), start);
        let job = worker.begin(start, true).unwrap();
        let _ = worker.finish(job);

        let wrapped_early = 10_000;
        assert_eq!(worker.request(alice(), wrapped_early), RequestOutcome::CoolingDown);
        let wrapped_late = 59_500;
        assert_eq!(worker.request(alice(), wrapped_late), RequestOutcome::Queued);
    }
}
