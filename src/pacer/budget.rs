use std::time::{Duration, Instant};

use crate::units::Bitrate;

/// Tokens are bits scaled by milliseconds, so refill arithmetic stays in
/// integers: one byte sent costs `8 * 1000` tokens, one millisecond refills
/// `target_bps` tokens.
const TOKENS_PER_BYTE: i64 = 8_000;

/// Token bucket tracking how much the pacer may send.
///
/// Media debits the bucket as it is sent; the worker refills it from the
/// target rate and spends any surplus on padding. The balance is clamped to
/// one window worth of tokens in both directions.
#[derive(Debug)]
pub(crate) struct IntervalBudget {
    window: Duration,
    rate_bps: i64,
    max_tokens: i64,
    tokens: i64,
    last_refill: Instant,
}

impl IntervalBudget {
    pub fn new(initial_rate: Bitrate, window: Duration, now: Instant) -> Self {
        let mut budget = IntervalBudget {
            window,
            rate_bps: 0,
            max_tokens: 0,
            tokens: 0,
            last_refill: now,
        };
        budget.set_target_rate(initial_rate, now);
        budget
    }

    /// Change the refill rate. The stored balance is clipped into the new
    /// window.
    pub fn set_target_rate(&mut self, rate: Bitrate, now: Instant) {
        self.refill(now);

        self.rate_bps = rate.as_u64() as i64;
        self.max_tokens = self.window.as_millis() as i64 * self.rate_bps;
        self.tokens = self.tokens.clamp(-self.max_tokens, self.max_tokens);
    }

    /// Debit the bucket for bytes sent. Never blocks; the balance just goes
    /// negative down to one window.
    pub fn use_budget(&mut self, bytes: usize, now: Instant) {
        self.refill(now);

        let tokens = bytes as i64 * TOKENS_PER_BYTE;
        self.tokens = (self.tokens - tokens).max(-self.max_tokens);
    }

    /// How many bytes of surplus are available for padding.
    pub fn bytes_remaining(&mut self, now: Instant) -> usize {
        self.refill(now);

        (self.tokens.max(0) / TOKENS_PER_BYTE) as usize
    }

    #[cfg(test)]
    pub fn tokens(&self) -> i64 {
        self.tokens
    }

    #[cfg(test)]
    pub fn max_tokens(&self) -> i64 {
        self.max_tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let whole_ms = elapsed.as_millis() as i64;
        if whole_ms <= 0 {
            return;
        }

        // Only consume whole milliseconds so sub-ms calls don't leak refill
        // time.
        self.last_refill += Duration::from_millis(whole_ms as u64);
        self.tokens = (self.tokens + whole_ms * self.rate_bps).min(self.max_tokens);
    }
}
