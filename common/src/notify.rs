use crate::clock::elapsed_ms;

/// Outbound message for the messaging channel. `force` bypasses dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub text: String,
    pub force: bool,
}

impl Notice {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            force: false,
        }
    }

    pub fn forced(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            force: true,
        }
    }
}

/// Suppresses an identical message sent again within the window.
#[derive(Debug, Clone)]
pub struct Outbox {
    window_ms: u32,
    last: Option<(String, u32)>,
}

impl Outbox {
    pub fn new(window_ms: u32) -> Self {
        Self {
            window_ms,
            last: None,
        }
    }

    pub fn admits(&self, notice: &Notice, now_ms: u32) -> bool {
        if notice.force {
            return true;
        }
        match &self.last {
            Some((text, sent_ms)) => {
                *text != notice.text || elapsed_ms(now_ms, *sent_ms) >= self.window_ms
            }
            None => true,
        }
    }

    /// Only successful sends are recorded.
    pub fn record_sent(&mut self, notice: &Notice, now_ms: u32) {
        self.last = Some((notice.text.clone(), now_ms));
    }
}

/// Splits line-oriented text into messages no longer than `max_chars`.
pub fn chunk_lines<'a, I>(lines: I, max_chars: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in lines {
        if !current.is_empty() && current.chars().count() + line.chars().count() + 1 > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dedups_same_text_within_window() {
        let mut outbox = Outbox::new(25_000);
        let notice = Notice::new("RÖLE: ON");
        assert!(outbox.admits(&notice, 0));
        outbox.record_sent(&notice, 0);

        assert!(!outbox.admits(&notice, 10_000));
        assert!(outbox.admits(&Notice::forced("RÖLE: ON"), 10_000));
        assert!(outbox.admits(&Notice::new("RÖLE: OFF"), 10_000));
        assert!(outbox.admits(&notice, 25_000));
    }

    #[test]
    fn chunks_on_line_boundaries() {
        let lines = ["aaaa", "bbbb", "cccc"];
        let chunks = chunk_lines(lines, 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb\n".to_string(), "cccc\n".to_string()]);
        assert!(chunk_lines(std::iter::empty(), 10).is_empty());
    }
}
