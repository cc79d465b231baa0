//! Learning Rate Scheduler Module
//!
//! Step-level warmup followed by a truncated cosine decay. The multiplier is
//! applied to the optimizer's base learning rate; only the step counter is
//! stateful and it is persisted with checkpoints.

use serde::{Deserialize, Serialize};

/// Cosine cycles over the post-warmup span (7/16 of a period)
pub const DEFAULT_NUM_CYCLES: f64 = 7.0 / 16.0;

/// Persisted scheduler state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    /// Number of optimizer steps taken so far
    pub step: u64,
}

/// Linear warmup then `max(0, cos(pi * cycles * progress))`
///
/// The warmup length is fractional: a warmup of 0.5 epochs over 3 batches
/// per epoch is 1.5 steps, not 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosineWarmupSchedule {
    pub warmup_steps: f64,
    pub total_steps: u64,
    pub num_cycles: f64,
    state: ScheduleState,
}

impl CosineWarmupSchedule {
    /// Create a scheduler positioned at step 0
    pub fn new(warmup_steps: f64, total_steps: u64, num_cycles: f64) -> Self {
        Self {
            warmup_steps,
            total_steps,
            num_cycles,
            state: ScheduleState::default(),
        }
    }

    /// Learning rate multiplier for an arbitrary step, in `[0, 1]`
    pub fn multiplier(&self, step: u64) -> f64 {
        let step = step as f64;
        let warmup = self.warmup_steps.max(0.0);
        if step < warmup {
            return step / warmup.max(1.0);
        }
        let progress = (step - warmup) / (self.total_steps as f64 - warmup).max(1.0);
        (std::f64::consts::PI * self.num_cycles * progress).cos().max(0.0)
    }

    /// Multiplier at the current step
    pub fn current_multiplier(&self) -> f64 {
        self.multiplier(self.state.step)
    }

    /// Learning rate at the current step for a given base rate
    pub fn lr(&self, base_lr: f64) -> f64 {
        base_lr * self.current_multiplier()
    }

    /// Advance by one optimizer step
    pub fn step(&mut self) {
        self.state.step += 1;
    }

    pub fn current_step(&self) -> u64 {
        self.state.step
    }

    pub fn state(&self) -> ScheduleState {
        self.state
    }

    pub fn load_state(&mut self, state: ScheduleState) {
        self.state = state;
    }

    /// Get a description of the scheduler
    pub fn description(&self) -> String {
        format!(
            "Warmup + Cosine: warmup={:.2} steps, total={} steps, cycles={:.4}",
            self.warmup_steps, self.total_steps, self.num_cycles
        )
    }
}
