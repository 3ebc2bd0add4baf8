use crate::clock::elapsed_ms;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkUpdate {
    /// New state when it differs from the last observation.
    pub changed: Option<bool>,
    /// Caller should kick off a reconnect attempt.
    pub reconnect: bool,
}

/// Tracks station connectivity and rate-limits reconnect attempts.
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    retry_ms: u32,
    connected: Option<bool>,
    last_attempt_ms: Option<u32>,
}

impl LinkMonitor {
    pub fn new(retry_ms: u32) -> Self {
        Self {
            retry_ms,
            connected: None,
            last_attempt_ms: None,
        }
    }

    pub fn observe(&mut self, connected: bool, now_ms: u32) -> LinkUpdate {
        let changed = (self.connected != Some(connected)).then_some(connected);
        self.connected = Some(connected);

        if connected {
            self.last_attempt_ms = None;
            return LinkUpdate {
                changed,
                reconnect: false,
            };
        }

        let due = match self.last_attempt_ms {
            Some(last) => elapsed_ms(now_ms, last) >= self.retry_ms,
            None => true,
        };
        if due {
            self.last_attempt_ms = Some(now_ms);
        }
        LinkUpdate {
            changed,
            reconnect: due,
        }
    }
}
