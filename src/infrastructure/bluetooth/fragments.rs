//! Fragment Reassembler
//!
//! Notifications arrive in MTU-sized pieces. JSON objects are accumulated
//! until their braces balance and the text parses; anything else arriving
//! between messages is passed through as a standalone legacy text message.
//!
//! The reassembler never reads the clock itself. Callers pass `now` with each
//! fragment and ask for [`FragmentReassembler::deadline`] to schedule the
//! inactivity check.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Buffer cap used by the reference firmware profile
pub const DEFAULT_MAX_BUFFER: usize = 2000;

/// Inactivity window before a partial message is dropped
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembledMessage {
    /// A complete, syntactically valid JSON object.
    Json(String),
    /// A non-JSON fragment received while idle.
    Text(String),
}

#[derive(Debug)]
enum ReassemblyState {
    Idle,
    Accumulating {
        buffer: String,
        depth: i64,
        in_string: bool,
        escaped: bool,
        last_fragment: Instant,
    },
}

pub struct FragmentReassembler {
    state: ReassemblyState,
    max_buffer: usize,
    timeout: Duration,
}

impl FragmentReassembler {
    pub fn new(max_buffer: usize, timeout: Duration) -> Self {
        Self {
            state: ReassemblyState::Idle,
            max_buffer,
            timeout,
        }
    }

    pub fn is_accumulating(&self) -> bool {
        matches!(self.state, ReassemblyState::Accumulating { .. })
    }

    pub fn buffered_len(&self) -> usize {
        match &self.state {
            ReassemblyState::Idle => 0,
            ReassemblyState::Accumulating { buffer, .. } => buffer.len(),
        }
    }

    /// When the pending partial message expires, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            ReassemblyState::Idle => None,
            ReassemblyState::Accumulating { last_fragment, .. } => {
                Some(*last_fragment + self.timeout)
            }
        }
    }

    /// Drop whatever is buffered. Called for every new connection.
    pub fn reset(&mut self) {
        self.state = ReassemblyState::Idle;
    }

    /// Discard the partial message if its window has elapsed.
    /// Returns true when something was discarded.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                warn!(
                    "Fragment assembly timed out, discarding {} buffered bytes",
                    self.buffered_len()
                );
                self.reset();
                true
            }
            _ => false,
        }
    }

    pub fn on_fragment(&mut self, fragment: &str, now: Instant) -> Option<AssembledMessage> {
        self.expire(now);

        if let ReassemblyState::Idle = self.state {
            if !fragment.trim_start().starts_with('{') {
                if fragment.trim().is_empty() {
                    return None;
                }
                return Some(AssembledMessage::Text(fragment.to_string()));
            }
            self.state = ReassemblyState::Accumulating {
                buffer: String::new(),
                depth: 0,
                in_string: false,
                escaped: false,
                last_fragment: now,
            };
        }

        let ReassemblyState::Accumulating {
            buffer,
            depth,
            in_string,
            escaped,
            last_fragment,
        } = &mut self.state
        else {
            return None;
        };

        buffer.push_str(fragment);
        *last_fragment = now;

        if buffer.len() > self.max_buffer {
            warn!(
                "Fragment buffer exceeded {} bytes, discarding partial message",
                self.max_buffer
            );
            self.reset();
            return None;
        }

        // Braces inside string literals do not count.
        for c in fragment.chars() {
            if *in_string {
                match c {
                    _ if *escaped => *escaped = false,
                    '\\' => *escaped = true,
                    '"' => *in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => *in_string = true,
                '{' => *depth += 1,
                '}' => *depth -= 1,
                _ => {}
            }
        }

        if *depth > 0 {
            debug!("Buffered fragment, {} bytes pending", buffer.len());
            return None;
        }

        let text = std::mem::take(buffer);
        let balanced = *depth == 0;
        self.reset();

        if balanced && is_json_object(&text) {
            Some(AssembledMessage::Json(text))
        } else {
            // Extra text after a closed object can never become valid JSON.
            warn!("Discarding malformed message: {}", text);
            None
        }
    }
}

impl Default for FragmentReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER, DEFAULT_TIMEOUT)
    }
}

fn is_json_object(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with('{')
        && trimmed.ends_with('}')
        && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
}
