use std::time::Duration;

use crate::config::RecordingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStep {
    /// Tell the operator how much time is left
    Warn { remaining: Duration },
    /// Budget used up
    Stop,
}

/// When each budget step fires, measured from recording start
pub fn schedule(cfg: &RecordingConfig) -> Vec<(Duration, BudgetStep)> {
    let budget = cfg.budget();
    let mut steps: Vec<(Duration, BudgetStep)> = cfg
        .warnings()
        .into_iter()
        .map(|remaining| (budget - remaining, BudgetStep::Warn { remaining }))
        .collect();
    if cfg.hard_stop {
        steps.push((budget, BudgetStep::Stop));
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let steps = schedule(&RecordingConfig::default());
        assert_eq!(
            steps,
            vec![
                (
                    Duration::from_secs(50 * 60),
                    BudgetStep::Warn {
                        remaining: Duration::from_secs(10 * 60)
                    }
                ),
                (
                    Duration::from_secs(55 * 60),
                    BudgetStep::Warn {
                        remaining: Duration::from_secs(5 * 60)
                    }
                ),
                (Duration::from_secs(60 * 60), BudgetStep::Stop),
            ]
        );
    }

    #[test]
    fn test_advisory_budget_has_no_stop() {
        let cfg = RecordingConfig {
            budget_secs: 120,
            warn_before_secs: vec![300, 60],
            hard_stop: false,
        };
        assert_eq!(
            schedule(&cfg),
            vec![(
                Duration::from_secs(60),
                BudgetStep::Warn {
                    remaining: Duration::from_secs(60)
                }
            )]
        );
    }
}
