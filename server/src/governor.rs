//! Overload governor.
//!
//! Watches whether ticks finish their network work within budget. After
//! `enter_after` consecutive overrun ticks the server enters degraded mode:
//! new logins are refused with `ServerBusy` and clients are told the server is
//! busy. After `recover_after` consecutive clean ticks it leaves again.
//! Both thresholds are counted independently, so a single clean tick in the
//! middle of a streak of overruns resets the entry count and vice versa.

use crate::config::OverloadConfig;
use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    EnteredDegraded,
    Recovered,
}

#[derive(Debug)]
pub struct OverloadGovernor {
    enter_after: u32,
    recover_after: u32,
    pressure_cap: u32,
    /// Rises by one per overrun tick and falls by one per clean tick
    pressure: u32,
    overrun_streak: u32,
    clean_streak: u32,
    degraded: bool,
}

impl OverloadGovernor {
    pub fn new(config: &OverloadConfig) -> Self {
        Self {
            enter_after: config.enter_after.max(1),
            recover_after: config.recover_after.max(1),
            pressure_cap: config.pressure_cap.max(1),
            pressure: 0,
            overrun_streak: 0,
            clean_streak: 0,
            degraded: false,
        }
    }

    /// Feeds one finished tick. Returns the transition it caused, if any.
    pub fn record_tick(&mut self, overran: bool) -> Option<Transition> {
        if overran {
            self.pressure = (self.pressure + 1).min(self.pressure_cap);
            self.overrun_streak += 1;
            self.clean_streak = 0;
            if !self.degraded && self.overrun_streak >= self.enter_after {
                self.degraded = true;
                warn!(
                    "Network work overran its budget for {} ticks, refusing new logins",
                    self.overrun_streak
                );
                return Some(Transition::EnteredDegraded);
            }
        } else {
            self.pressure = self.pressure.saturating_sub(1);
            self.clean_streak += 1;
            self.overrun_streak = 0;
            if self.degraded && self.clean_streak >= self.recover_after {
                self.degraded = false;
                info!(
                    "Network work back within budget for {} ticks, accepting logins",
                    self.clean_streak
                );
                return Some(Transition::Recovered);
            }
        }
        None
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn pressure(&self) -> u32 {
        self.pressure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(enter_after: u32, recover_after: u32) -> OverloadGovernor {
        OverloadGovernor::new(&OverloadConfig {
            enter_after,
            recover_after,
            deny_logins_when_overloaded: true,
            pressure_cap: 100,
        })
    }

    #[test]
    fn test_enters_after_k_overruns() {
        let mut g = governor(3, 5);
        assert_eq!(g.record_tick(true), None);
        assert_eq!(g.record_tick(true), None);
        assert!(!g.is_degraded());
        assert_eq!(g.record_tick(true), Some(Transition::EnteredDegraded));
        assert!(g.is_degraded());
        // already degraded: no second transition
        assert_eq!(g.record_tick(true), None);
    }

    #[test]
    fn test_clean_tick_resets_entry_streak() {
        let mut g = governor(3, 5);
        g.record_tick(true);
        g.record_tick(true);
        g.record_tick(false);
        g.record_tick(true);
        g.record_tick(true);
        assert!(!g.is_degraded());
    }

    #[test]
    fn test_recovers_after_m_clean_ticks() {
        let mut g = governor(1, 3);
        assert_eq!(g.record_tick(true), Some(Transition::EnteredDegraded));

        assert_eq!(g.record_tick(false), None);
        assert_eq!(g.record_tick(false), None);
        assert!(g.is_degraded());
        assert_eq!(g.record_tick(false), Some(Transition::Recovered));
        assert!(!g.is_degraded());
    }

    #[test]
    fn test_overrun_interrupts_recovery() {
        let mut g = governor(1, 3);
        g.record_tick(true);
        g.record_tick(false);
        g.record_tick(false);
        g.record_tick(true);
        g.record_tick(false);
        g.record_tick(false);
        assert!(g.is_degraded());
        assert_eq!(g.record_tick(false), Some(Transition::Recovered));
    }

    #[test]
    fn test_pressure_is_capped() {
        let mut g = OverloadGovernor::new(&OverloadConfig {
            enter_after: 100,
            recover_after: 1,
            deny_logins_when_overloaded: true,
            pressure_cap: 4,
        });
        for _ in 0..10 {
            g.record_tick(true);
        }
        assert_eq!(g.pressure(), 4);
        g.record_tick(false);
        assert_eq!(g.pressure(), 3);
    }
}
