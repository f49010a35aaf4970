//! Tests for learning rate schedulers
//!
//! This file tests all LRScheduler implementations:
//! - Constant: fixed rate, ignores validation
//! - StepDecay: step-based decay with gamma factor
//! - ExponentialDecay: continuous exponential decay
//! - Halving: validation-driven halving and early stop

use approx::assert_relative_eq;
use rust_neural_lm::driver::SchedulerSpec;
use rust_neural_lm::utils::lr_scheduler::{Constant, ExponentialDecay, Halving, LRScheduler, StepDecay};

// ============================================================================
// StepDecay Tests
// ============================================================================

mod step_decay_tests {
    use super::*;

    #[test]
    fn test_step_decay_before_first_step() {
        let mut scheduler = StepDecay::new(0.1, 3, 0.5);
        for _ in 0..2 {
            scheduler.step();
            assert_eq!(scheduler.get_lr(), 0.1);
        }
    }

    #[test]
    fn test_step_decay_multiple_steps() {
        let mut scheduler = StepDecay::new(0.1, 3, 0.5);
        for _ in 0..9 {
            scheduler.step();
        }
        assert_relative_eq!(scheduler.get_lr(), 0.0125, epsilon = 1e-7);
    }

    #[test]
    fn test_step_decay_reset() {
        let mut scheduler = StepDecay::new(0.1, 1, 0.1);
        scheduler.step();
        scheduler.step();
        scheduler.reset();
        assert_eq!(scheduler.get_lr(), 0.1);
    }

    #[test]
    fn test_zero_step_size_is_clamped() {
        let mut scheduler = StepDecay::new(0.1, 0, 0.5);
        scheduler.step();
        assert_relative_eq!(scheduler.get_lr(), 0.05, epsilon = 1e-7);
    }
}

// ============================================================================
// ExponentialDecay Tests
// ============================================================================

mod exponential_decay_tests {
    use super::*;

    #[test]
    fn test_exponential_decay_sequence() {
        let mut scheduler = ExponentialDecay::new(1.0, 0.9);
        let mut expected = 1.0f32;
        for _ in 0..5 {
            assert_relative_eq!(scheduler.get_lr(), expected, epsilon = 1e-6);
            scheduler.step();
            expected *= 0.9;
        }
    }

    #[test]
    fn test_exponential_ignores_validation() {
        let mut scheduler = ExponentialDecay::new(0.5, 0.5);
        assert!(scheduler.observe_validation(10.0));
        assert!(scheduler.observe_validation(20.0));
        assert_eq!(scheduler.get_lr(), 0.5);
    }
}

// ============================================================================
// Halving Tests
// ============================================================================

mod halving_tests {
    use super::*;

    #[test]
    fn test_rate_holds_while_improving() {
        let mut scheduler = Halving::new(0.2, 0.01);
        for entropy in [8.0, 7.0, 6.0, 5.5] {
            assert!(scheduler.observe_validation(entropy));
            scheduler.step();
        }
        assert_eq!(scheduler.get_lr(), 0.2);
        assert!(!scheduler.is_halving());
    }

    #[test]
    fn test_halves_then_stops() {
        let mut scheduler = Halving::new(0.2, 0.01);
        assert!(scheduler.observe_validation(8.0));
        assert!(scheduler.observe_validation(7.99));
        assert!(scheduler.is_halving());
        assert_relative_eq!(scheduler.get_lr(), 0.1);

        // still improving enough: keep halving
        assert!(scheduler.observe_validation(7.0));
        assert_relative_eq!(scheduler.get_lr(), 0.05);

        assert!(!scheduler.observe_validation(6.99));
    }

    #[test]
    fn test_worse_entropy_counts_as_no_improvement() {
        let mut scheduler = Halving::new(1.0, 0.0);
        assert!(scheduler.observe_validation(5.0));
        assert!(scheduler.observe_validation(6.0));
        assert!(scheduler.is_halving());
        assert!(!scheduler.observe_validation(6.0));
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut scheduler = Halving::new(0.4, 0.5);
        scheduler.observe_validation(4.0);
        scheduler.observe_validation(4.0);
        scheduler.reset();
        assert_eq!(scheduler.get_lr(), 0.4);
        assert!(!scheduler.is_halving());
        assert!(scheduler.observe_validation(4.0));
    }
}

// ============================================================================
// Scheduler Spec Tests
// ============================================================================

mod spec_tests {
    use super::*;

    fn run(spec: SchedulerSpec, epochs: usize) -> f32 {
        let mut scheduler = spec.build(0.1);
        for _ in 0..epochs {
            scheduler.step();
        }
        scheduler.get_lr()
    }

    #[test]
    fn test_spec_builds_matching_scheduler() {
        assert_eq!(run(SchedulerSpec::Constant, 5), 0.1);
        assert_relative_eq!(
            run(SchedulerSpec::StepDecay { step_size: 2, gamma: 0.5 }, 4),
            0.025,
            epsilon = 1e-7
        );
        assert_relative_eq!(run(SchedulerSpec::Exponential { gamma: 0.5 }, 2), 0.025, epsilon = 1e-7);
        assert_eq!(run(SchedulerSpec::Halving { min_improvement: 0.1 }, 5), 0.1);
    }

    #[test]
    fn test_constant_matches_direct_construction() {
        let built = SchedulerSpec::Constant.build(0.3);
        let direct = Constant::new(0.3);
        assert_eq!(built.get_lr(), direct.get_lr());
    }
}
