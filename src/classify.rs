//! proximity classification.
//!
//! the nearer of the two distance readings decides the band. bounds are
//! strict: a reading exactly on a threshold falls into the next band out.

use crate::domain::{AlertLevel, Status, ThresholdConfig};

pub fn classify(d1: f64, d2: f64, cfg: &ThresholdConfig) -> Status {
    let nearest = d1.min(d2);
    if nearest < cfg.danger {
        Status::Danger
    } else if nearest < cfg.warning {
        Status::Warning
    } else {
        Status::Normal
    }
}

/// classify and derive the alert level in one step
pub fn assess(d1: f64, d2: f64, cfg: &ThresholdConfig) -> (Status, AlertLevel) {
    let status = classify(d1, d2, cfg);
    (status, AlertLevel::from(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: ThresholdConfig = ThresholdConfig { danger: 15.0, warning: 25.0 };

    #[test]
    fn bands() {
        assert_eq!(classify(10.0, 80.0, &CFG), Status::Danger);
        assert_eq!(classify(80.0, 20.0, &CFG), Status::Warning);
        assert_eq!(classify(80.0, 90.0, &CFG), Status::Normal);
    }

    #[test]
    fn boundaries_are_strict() {
        // exactly on danger is warning, exactly on warning is normal
        assert_eq!(classify(15.0, 100.0, &CFG), Status::Warning);
        assert_eq!(classify(100.0, 25.0, &CFG), Status::Normal);
        assert_eq!(classify(14.999, 100.0, &CFG), Status::Danger);
        assert_eq!(classify(100.0, 24.999, &CFG), Status::Warning);
    }

    #[test]
    fn nearest_reading_wins() {
        assert_eq!(classify(12.0, 50.0, &CFG), Status::Danger);
        assert_eq!(classify(50.0, 12.0, &CFG), Status::Danger);
    }

    #[test]
    fn totality_over_a_grid() {
        let configs = [
            ThresholdConfig { danger: 1.0, warning: 2.0 },
            CFG,
            ThresholdConfig { danger: 40.0, warning: 400.0 },
        ];
        for cfg in &configs {
            for d1 in (0..=500).step_by(7) {
                for d2 in (0..=500).step_by(11) {
                    let (d1, d2) = (f64::from(d1), f64::from(d2));
                    let nearest = d1.min(d2);
                    let expected = if nearest < cfg.danger {
                        Status::Danger
                    } else if nearest < cfg.warning {
                        Status::Warning
                    } else {
                        Status::Normal
                    };
                    assert_eq!(classify(d1, d2, cfg), expected, "d1={d1} d2={d2} cfg={cfg:?}");
                }
            }
        }
    }

    #[test]
    fn assess_pairs_status_with_alert_level() {
        assert_eq!(assess(12.0, 50.0, &CFG), (Status::Danger, AlertLevel::High));
        assert_eq!(assess(20.0, 50.0, &CFG), (Status::Warning, AlertLevel::Medium));
        assert_eq!(assess(30.0, 50.0, &CFG), (Status::Normal, AlertLevel::Low));
    }
}
