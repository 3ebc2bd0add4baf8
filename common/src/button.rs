use crate::clock::elapsed_ms;

/// Press detector for an active-low push button. A level has to hold for the
/// full window before it is accepted.
#[derive(Debug, Clone)]
pub struct ButtonDebouncer {
    window_ms: u32,
    last_read: bool,
    stable: bool,
    last_change_ms: u32,
}

impl ButtonDebouncer {
    pub fn new(window_ms: u32) -> Self {
        Self {
            window_ms,
            last_read: false,
            stable: false,
            last_change_ms: 0,
        }
    }

    /// `pressed` is the raw reading (line pulled low). Returns true exactly
    /// once per debounced press.
    pub fn update(&mut self, pressed: bool, now_ms: u32) -> bool {
        if pressed != self.last_read {
            self.last_read = pressed;
            self.last_change_ms = now_ms;
        }

        if elapsed_ms(now_ms, self.last_change_ms) > self.window_ms && self.stable != self.last_read {
            self.stable = self.last_read;
            return self.stable;
        }
        false
    }
}
