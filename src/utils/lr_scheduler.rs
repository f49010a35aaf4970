//! Learning rate scheduler trait and implementations
//!
//! This module defines the LRScheduler trait for adjusting the learning rate
//! between training epochs. The driver asks the scheduler for the rate before
//! every epoch, steps it afterwards, and reports validation entropy so that
//! validation-driven schedules can halve the rate or end training.

/// Core trait for learning rate schedulers.
///
/// Schedulers adjust the learning rate during training based on the current epoch
/// and, optionally, on held-out entropy.
///
/// # Example
///
/// ```ignore
/// let mut scheduler = StepDecay::new(0.1, 3, 0.5);
///
/// for epoch in 0..num_epochs {
///     let lr = scheduler.get_lr();
///     // ... train one epoch with `lr` ...
///     scheduler.step();
///     if !scheduler.observe_validation(valid_entropy) {
///         break;
///     }
/// }
/// ```
pub trait LRScheduler: Send {
    /// Get the current learning rate.
    fn get_lr(&self) -> f32;

    /// Advance the scheduler to the next epoch.
    fn step(&mut self);

    /// Reset the scheduler to its initial state.
    fn reset(&mut self);

    /// Report the validation entropy measured after an epoch.
    ///
    /// Returns `false` when training should stop. Schedules that ignore
    /// validation data always return `true`.
    fn observe_validation(&mut self, _entropy: f64) -> bool {
        true
    }
}

/// Keeps the learning rate fixed.
pub struct Constant {
    lr: f32,
}

impl Constant {
    /// Creates a constant schedule.
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl LRScheduler for Constant {
    fn get_lr(&self) -> f32 {
        self.lr
    }

    fn step(&mut self) {}

    fn reset(&mut self) {}
}

/// Multiplies the rate by `gamma` once every `step_size` epochs.
///
/// ```ignore
/// use rust_neural_lm::utils::lr_scheduler::{LRScheduler, StepDecay};
///
/// let mut scheduler = StepDecay::new(0.1, 3, 0.5);
/// for _ in 0..3 {
///     scheduler.step();
/// }
/// assert_eq!(scheduler.get_lr(), 0.05);
/// ```
pub struct StepDecay {
    base_lr: f32,
    gamma: f32,
    step_size: usize,
    epoch: usize,
}

impl StepDecay {
    /// A `step_size` of 0 is treated as 1.
    pub fn new(initial_lr: f32, step_size: usize, gamma: f32) -> Self {
        Self {
            base_lr: initial_lr,
            gamma,
            step_size: step_size.max(1),
            epoch: 0,
        }
    }
}

impl LRScheduler for StepDecay {
    fn get_lr(&self) -> f32 {
        let decays = (self.epoch / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    fn step(&mut self) {
        self.epoch += 1;
    }

    fn reset(&mut self) {
        self.epoch = 0;
    }
}

/// Multiplies the rate by `gamma` after every epoch.
pub struct ExponentialDecay {
    base_lr: f32,
    gamma: f32,
    epoch: usize,
}

impl ExponentialDecay {
    pub fn new(initial_lr: f32, gamma: f32) -> Self {
        Self {
            base_lr: initial_lr,
            gamma,
            epoch: 0,
        }
    }
}

impl LRScheduler for ExponentialDecay {
    fn get_lr(&self) -> f32 {
        self.base_lr * self.gamma.powi(self.epoch as i32)
    }

    fn step(&mut self) {
        self.epoch += 1;
    }

    fn reset(&mut self) {
        self.epoch = 0;
    }
}

/// Validation-driven halving.
///
/// The rate stays constant while the relative validation entropy
/// improvement is at least `min_improvement`. The first epoch that improves
/// less starts halving: from then on the rate is halved after every epoch,
/// and training stops as soon as another epoch fails to improve enough.
pub struct Halving {
    initial_lr: f32,
    current_lr: f32,
    min_improvement: f64,
    halving: bool,
    last_entropy: Option<f64>,
}

impl Halving {
    /// Creates a halving scheduler.
    pub fn new(initial_lr: f32, min_improvement: f64) -> Self {
        Self {
            initial_lr,
            current_lr: initial_lr,
            min_improvement,
            halving: false,
            last_entropy: None,
        }
    }

    /// Whether halving has started.
    pub fn is_halving(&self) -> bool {
        self.halving
    }
}

impl LRScheduler for Halving {
    fn get_lr(&self) -> f32 {
        self.current_lr
    }

    fn step(&mut self) {}

    fn reset(&mut self) {
        self.current_lr = self.initial_lr;
        self.halving = false;
        self.last_entropy = None;
    }

    fn observe_validation(&mut self, entropy: f64) -> bool {
        let Some(last) = self.last_entropy else {
            self.last_entropy = Some(entropy);
            return true;
        };

        let improvement = if last > 0.0 {
            (last - entropy) / last
        } else {
            0.0
        };
        self.last_entropy = Some(entropy.min(last));

        if self.halving {
            if improvement < self.min_improvement {
                return false;
            }
            self.current_lr *= 0.5;
        } else if improvement < self.min_improvement {
            self.halving = true;
            self.current_lr *= 0.5;
        }
        true
    }
}
