use serde::Serialize;

use crate::clock::Timestamp;
use crate::types::ActiveWindows;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    RelayOn,
    RelayOff,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OverrideState {
    #[serde(rename = "manualOnLatch")]
    pub manual_on_latch: bool,
    #[serde(rename = "manualOffUntil")]
    pub manual_off_until: Option<Timestamp>,
    #[serde(rename = "blockOnUntil")]
    pub block_on_until: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualOnOutcome {
    Applied(Vec<EngineAction>),
    Blocked { until: Timestamp },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualOffOutcome {
    /// End of the automatic window that was active, if any.
    pub until: Option<Timestamp>,
    pub actions: Vec<EngineAction>,
}

/// Merges the automatic windows with manual overrides into one relay state.
///
/// Precedence, highest first: the post forced-off block, the manual-off
/// deadline, then `scheduled || manual latch`. Without a synchronized clock
/// only the latch counts.
#[derive(Debug, Clone)]
pub struct RelayEngine {
    relay_on: bool,
    overrides: OverrideState,
    block_secs: i64,
}

impl RelayEngine {
    pub fn new(block_secs: i64) -> Self {
        Self {
            relay_on: false,
            overrides: OverrideState::default(),
            block_secs,
        }
    }

    pub fn is_relay_on(&self) -> bool {
        self.relay_on
    }

    pub fn overrides(&self) -> OverrideState {
        self.overrides
    }

    pub fn is_blocked(&self, now: Timestamp) -> bool {
        self.overrides.block_on_until.is_some_and(|until| now < until)
    }

    pub fn evaluate(&mut self, now: Option<Timestamp>, windows: ActiveWindows) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let desired = self.desired_state(now, windows);
        self.set_relay(desired, &mut actions);
        actions
    }

    /// Caller recomputes the forced-off schedule before this so a block that
    /// was just armed is taken into account.
    pub fn command_on(&mut self, now: Option<Timestamp>) -> ManualOnOutcome {
        self.overrides.manual_off_until = None;
        let blocked_until = self
            .overrides
            .block_on_until
            .filter(|until| now.is_some_and(|now| now < *until));
        if let Some(until) = blocked_until {
            return ManualOnOutcome::Blocked { until };
        }

        self.overrides.manual_on_latch = true;
        let mut actions = Vec::new();
        self.set_relay(true, &mut actions);
        ManualOnOutcome::Applied(actions)
    }

    /// Keeps the relay off through the remainder of whichever automatic
    /// window is active.
    pub fn command_off(&mut self, now: Option<Timestamp>, windows: ActiveWindows) -> ManualOffOutcome {
        let until = now.and_then(|now| windows.active_until(now));
        self.overrides.manual_off_until = until;
        self.overrides.manual_on_latch = false;

        let mut actions = Vec::new();
        self.set_relay(false, &mut actions);
        ManualOffOutcome { until, actions }
    }

    /// Press only ever turns on. While a forced-off block is running the latch
    /// is armed but the relay waits for the block to lapse.
    pub fn button_pressed(&mut self, now: Option<Timestamp>) -> Vec<EngineAction> {
        self.overrides.manual_off_until = None;
        self.overrides.manual_on_latch = true;

        let mut actions = Vec::new();
        if now.is_some_and(|now| self.is_blocked(now)) {
            return actions;
        }
        self.set_relay(true, &mut actions);
        actions
    }

    pub fn force_off(&mut self, now: Timestamp) -> Vec<EngineAction> {
        self.overrides.manual_on_latch = false;
        self.overrides.block_on_until = Some(now + self.block_secs);

        let mut actions = Vec::new();
        self.set_relay(false, &mut actions);
        actions
    }

    fn desired_state(&mut self, now: Option<Timestamp>, windows: ActiveWindows) -> bool {
        let Some(now) = now else {
            return self.overrides.manual_on_latch;
        };

        self.expire_overrides(now);
        if self.is_blocked(now) {
            return false;
        }
        if self.overrides.manual_off_until.is_some() {
            return false;
        }
        windows.scheduled_on(now) || self.overrides.manual_on_latch
    }

    fn expire_overrides(&mut self, now: Timestamp) {
        if self.overrides.manual_off_until.is_some_and(|until| now >= until) {
            self.overrides.manual_off_until = None;
        }
        if self.overrides.block_on_until.is_some_and(|until| now >= until) {
            self.overrides.block_on_until = None;
        }
    }

    fn set_relay(&mut self, on: bool, actions: &mut Vec<EngineAction>) {
        if self.relay_on == on {
            return;
        }
        self.relay_on = on;
        actions.push(if on {
            EngineAction::RelayOn
        } else {
            EngineAction::RelayOff
        });
    }
}
