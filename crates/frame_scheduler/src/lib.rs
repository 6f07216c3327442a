#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSchedulerConfig {
    pub frame_rate: u32,
    pub max_updates_per_frame: u32,
}

impl Default for FrameSchedulerConfig {
    fn default() -> Self {
        Self {
            frame_rate: 60,
            max_updates_per_frame: 4,
        }
    }
}

impl FrameSchedulerConfig {
    /// Panics on a zero frame rate or update cap.
    pub fn validate(&self) {
        if self.frame_rate == 0 {
            panic!("invalid frame scheduler config: frame_rate must be positive");
        }
        if self.max_updates_per_frame == 0 {
            panic!("invalid frame scheduler config: max_updates_per_frame must be positive");
        }
    }

    pub fn step_micros(&self) -> u64 {
        self.validate();
        1_000_000 / u64::from(self.frame_rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSchedulerInput {
    pub frame_sequence_id: u64,
    pub elapsed_micros: u64,
    pub run_loop_stopped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerUpdateReason {
    Halted,
    Resumed,
    CatchUpCapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSchedulerDecision {
    pub frame_sequence_id: u64,
    pub updates_to_run: u32,
    pub render: bool,
    pub update_reason: Option<SchedulerUpdateReason>,
}

/// Fixed-step cadence: elapsed time accumulates and is spent in whole update
/// steps, at most `max_updates_per_frame` per frame.
#[derive(Debug, Clone)]
pub struct FrameScheduler {
    config: FrameSchedulerConfig,
    accumulator_micros: u64,
    halted: bool,
}

impl FrameScheduler {
    pub fn new(config: FrameSchedulerConfig) -> Self {
        config.validate();
        Self {
            config,
            accumulator_micros: 0,
            halted: false,
        }
    }

    pub fn config(&self) -> FrameSchedulerConfig {
        self.config
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn accumulated_micros(&self) -> u64 {
        self.accumulator_micros
    }

    pub fn schedule_frame(&mut self, input: FrameSchedulerInput) -> FrameSchedulerDecision {
        if input.run_loop_stopped {
            let newly_halted = !self.halted;
            self.halted = true;
            return FrameSchedulerDecision {
                frame_sequence_id: input.frame_sequence_id,
                updates_to_run: 0,
                render: false,
                update_reason: newly_halted.then_some(SchedulerUpdateReason::Halted),
            };
        }

        if self.halted {
            // The elapsed time spans the stall; drop it instead of catching up.
            self.halted = false;
            self.accumulator_micros = 0;
            return FrameSchedulerDecision {
                frame_sequence_id: input.frame_sequence_id,
                updates_to_run: 0,
                render: true,
                update_reason: Some(SchedulerUpdateReason::Resumed),
            };
        }

        let step = self.config.step_micros();
        self.accumulator_micros = self.accumulator_micros.saturating_add(input.elapsed_micros);
        let due_steps = self.accumulator_micros / step;
        let ceiling = u64::from(self.config.max_updates_per_frame);
        if due_steps > ceiling {
            self.accumulator_micros = 0;
            return FrameSchedulerDecision {
                frame_sequence_id: input.frame_sequence_id,
                updates_to_run: self.config.max_updates_per_frame,
                render: true,
                update_reason: Some(SchedulerUpdateReason::CatchUpCapped),
            };
        }

        self.accumulator_micros -= due_steps * step;
        FrameSchedulerDecision {
            frame_sequence_id: input.frame_sequence_id,
            updates_to_run: u32::try_from(due_steps)
                .unwrap_or_else(|_| panic!("due steps {due_steps} exceed u32 after capping")),
            render: true,
            update_reason: None,
        }
    }
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new(FrameSchedulerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(frame_sequence_id: u64, elapsed_micros: u64, run_loop_stopped: bool) -> FrameSchedulerInput {
        FrameSchedulerInput {
            frame_sequence_id,
            elapsed_micros,
            run_loop_stopped,
        }
    }

    #[test]
    fn accumulates_partial_steps_across_frames() {
        let mut scheduler = FrameScheduler::new(FrameSchedulerConfig {
            frame_rate: 100,
            max_updates_per_frame: 4,
        });

        let first = scheduler.schedule_frame(frame(1, 6_000, false));
        assert_eq!(first.updates_to_run, 0);
        assert!(first.render);

        let second = scheduler.schedule_frame(frame(2, 6_000, false));
        assert_eq!(second.updates_to_run, 1);
        assert_eq!(second.update_reason, None);
        assert_eq!(scheduler.accumulated_micros(), 2_000);
    }

    #[test]
    fn caps_catch_up_and_drops_backlog() {
        let mut scheduler = FrameScheduler::new(FrameSchedulerConfig {
            frame_rate: 100,
            max_updates_per_frame: 3,
        });

        let decision = scheduler.schedule_frame(frame(9, 100_000, false));
        assert_eq!(decision.updates_to_run, 3);
        assert_eq!(
            decision.update_reason,
            Some(SchedulerUpdateReason::CatchUpCapped)
        );
        assert_eq!(scheduler.accumulated_micros(), 0);
    }

    #[test]
    fn halted_frames_run_nothing_and_report_once() {
        let mut scheduler = FrameScheduler::default();

        let first = scheduler.schedule_frame(frame(1, 16_000, true));
        let second = scheduler.schedule_frame(frame(2, 16_000, true));

        assert!(scheduler.is_halted());
        assert_eq!(first.update_reason, Some(SchedulerUpdateReason::Halted));
        assert_eq!(second.update_reason, None);
        assert_eq!(second.updates_to_run, 0);
        assert!(!second.render);
    }

    #[test]
    fn resume_discards_time_spent_halted() {
        let mut scheduler = FrameScheduler::default();
        let _ = scheduler.schedule_frame(frame(1, 10_000, false));
        let _ = scheduler.schedule_frame(frame(2, 5_000_000, true));

        let resumed = scheduler.schedule_frame(frame(3, 5_000_000, false));
        assert_eq!(resumed.updates_to_run, 0);
        assert_eq!(resumed.update_reason, Some(SchedulerUpdateReason::Resumed));
        assert_eq!(scheduler.accumulated_micros(), 0);

        let next = scheduler.schedule_frame(frame(4, 17_000, false));
        assert_eq!(next.updates_to_run, 1);
    }

    #[test]
    #[should_panic(expected = "frame_rate must be positive")]
    fn rejects_zero_frame_rate() {
        let _ = FrameScheduler::new(FrameSchedulerConfig {
            frame_rate: 0,
            max_updates_per_frame: 1,
        });
    }

    #[test]
    #[should_panic(expected = "max_updates_per_frame must be positive")]
    fn rejects_zero_update_cap() {
        FrameSchedulerConfig {
            frame_rate: 60,
            max_updates_per_frame: 0,
        }
        .validate();
    }
}
