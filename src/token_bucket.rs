use std::time::Instant;

/// In-process token bucket. Callers supply the clock reading so that a single
/// lock holder can refill and consume as one step.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::starting_at(capacity, refill_rate, Instant::now())
    }

    pub fn starting_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: now,
        }
    }

    pub fn consume(&mut self, tokens: u32) -> bool {
        self.consume_at(tokens, Instant::now())
    }

    pub fn consume_at(&mut self, tokens: u32, now: Instant) -> bool {
        self.refill_at(now);

        if self.tokens >= tokens as f64 {
            self.tokens -= tokens as f64;
            true
        } else {
            false
        }
    }

    /// Returns tokens taken by a consume whose work never happened.
    pub fn refund(&mut self, tokens: u32) {
        self.tokens = (self.tokens + tokens as f64).min(self.capacity as f64);
    }

    pub fn available_at(&mut self, now: Instant) -> f64 {
        self.refill_at(now);
        self.tokens
    }

    fn refill_at(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);

        if !elapsed.is_zero() {
            let tokens_to_add = self.refill_rate * elapsed.as_secs_f64();
            self.tokens = (self.tokens + tokens_to_add).min(self.capacity as f64);
            self.last_refill = now;
        }
    }
}
