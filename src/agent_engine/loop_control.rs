// Loop control: turn ceiling, wall-clock deadline, no-progress streak, cancellation.
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent_engine::state::{ActionResult, ActionStatus, Termination};
use crate::config::AgentSettings;

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_turns: u32,
    pub max_duration: Option<Duration>,
    /// Consecutive no-progress turns tolerated before giving up.
    pub failed_turn_limit: u32,
}

impl LoopConfig {
    pub fn from_settings(agent: &AgentSettings, max_turns: u32) -> Self {
        Self {
            max_turns: max_turns.max(1),
            max_duration: agent.max_task_seconds.map(Duration::from_secs),
            failed_turn_limit: agent.failed_turn_limit.max(1),
        }
    }
}

/// What one finished turn means for the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnVerdict {
    Progress,
    /// Nothing succeeded, but the streak is still under the limit.
    NoProgress { streak: u32 },
    Stop(Termination),
}

pub struct LoopController {
    config: LoopConfig,
    start_time: Instant,
    no_progress_streak: u32,
    cancel: CancellationToken,
}

impl LoopController {
    pub fn new(config: LoopConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            no_progress_streak: 0,
            cancel,
        }
    }

    pub fn max_turns(&self) -> u32 {
        self.config.max_turns
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Checked at the top of every turn; `Some` means the loop must stop.
    pub fn check_before_turn(&self, turns_completed: u32) -> Option<Termination> {
        if self.cancel.is_cancelled() {
            return Some(Termination::CallerCancelled);
        }
        if let Some(limit) = self.config.max_duration {
            if self.start_time.elapsed() >= limit {
                return Some(Termination::DeadlineExceeded);
            }
        }
        if turns_completed >= self.config.max_turns {
            return Some(Termination::MaxTurnsExceeded);
        }
        None
    }

    /// Folds one turn's results into the no-progress streak.
    pub fn record_turn(&mut self, results: &[ActionResult]) -> TurnVerdict {
        if results.is_empty() || results.iter().any(ActionResult::is_success) {
            self.no_progress_streak = 0;
            return TurnVerdict::Progress;
        }

        self.no_progress_streak += 1;
        if self.no_progress_streak < self.config.failed_turn_limit {
            return TurnVerdict::NoProgress {
                streak: self.no_progress_streak,
            };
        }

        let all_denied = results.iter().all(|r| r.status == ActionStatus::Cancelled);
        TurnVerdict::Stop(if all_denied {
            Termination::AllActionsDenied
        } else {
            Termination::AllActionsFailed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_engine::state::ActionRequest;

    fn req() -> ActionRequest {
        ActionRequest {
            call_id: "c".into(),
            name: "click_at".into(),
            args: Default::default(),
            declared_risk: None,
        }
    }

    fn controller(max_turns: u32, limit: u32) -> LoopController {
        LoopController::new(
            LoopConfig {
                max_turns,
                max_duration: None,
                failed_turn_limit: limit,
            },
            CancellationToken::new(),
        )
    }

    #[test]
    fn stops_at_turn_ceiling() {
        let ctl = controller(2, 3);
        assert_eq!(ctl.check_before_turn(1), None);
        assert_eq!(ctl.check_before_turn(2), Some(Termination::MaxTurnsExceeded));
    }

    #[test]
    fn success_resets_streak() {
        let mut ctl = controller(10, 2);
        let failed = vec![ActionResult::error(&req(), "boom")];
        let mixed = vec![
            ActionResult::error(&req(), "boom"),
            ActionResult::success(&req(), Default::default()),
        ];
        assert_eq!(ctl.record_turn(&failed), TurnVerdict::NoProgress { streak: 1 });
        assert_eq!(ctl.record_turn(&mixed), TurnVerdict::Progress);
        assert_eq!(ctl.record_turn(&failed), TurnVerdict::NoProgress { streak: 1 });
        assert_eq!(
            ctl.record_turn(&failed),
            TurnVerdict::Stop(Termination::AllActionsFailed)
        );
    }

    #[test]
    fn all_denied_turn_is_reported_as_denial() {
        let mut ctl = controller(10, 1);
        let denied = vec![ActionResult::cancelled(&req(), "no")];
        assert_eq!(
            ctl.record_turn(&denied),
            TurnVerdict::Stop(Termination::AllActionsDenied)
        );

        let mut ctl = controller(10, 1);
        let mixed = vec![
            ActionResult::cancelled(&req(), "no"),
            ActionResult::error(&req(), "boom"),
        ];
        assert_eq!(
            ctl.record_turn(&mixed),
            TurnVerdict::Stop(Termination::AllActionsFailed)
        );
    }

    #[test]
    fn cancellation_wins() {
        let token = CancellationToken::new();
        let ctl = LoopController::new(
            LoopConfig {
                max_turns: 5,
                max_duration: None,
                failed_turn_limit: 3,
            },
            token.clone(),
        );
        token.cancel();
        assert_eq!(ctl.check_before_turn(0), Some(Termination::CallerCancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let ctl = LoopController::new(
            LoopConfig {
                max_turns: 5,
                max_duration: Some(Duration::from_secs(10)),
                failed_turn_limit: 3,
            },
            CancellationToken::new(),
        );
        assert_eq!(ctl.check_before_turn(0), None);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(ctl.check_before_turn(0), Some(Termination::DeadlineExceeded));
    }
}
