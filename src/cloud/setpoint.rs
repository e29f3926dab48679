//! Compensation set-point state.
//!
//! Converts cloud readings into the kilowatt figure the transform adds to
//! the meter image. Raw grid import is thresholded, clamped, smoothed with
//! an EMA and slew-limited so one bad sample can never slam the inverter,
//! then committed together with its update time. Readers get 0 whenever the
//! state is stale or the override is globally disabled.

use parking_lot::Mutex;

use super::client::CloudReading;
use crate::config::CloudConfig;

/// Result of folding one reading into the set-point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Commit {
    /// The inverter reported offline/alarm; the set-point was forced to 0.
    Alarm,
    Updated { delta_kw: f64 },
}

#[derive(Debug, Clone, Copy)]
struct SetpointState {
    delta_kw: f64,
    last_update_ms: i64,
}

pub struct Compensator {
    cfg: CloudConfig,
    state: Mutex<SetpointState>,
}

impl Compensator {
    pub fn new(cfg: CloudConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(SetpointState {
                delta_kw: 0.0,
                last_update_ms: 0,
            }),
        }
    }

    /// Fold one cloud reading into the set-point and commit it.
    pub fn apply_reading(&self, reading: &CloudReading, now_ms: i64) -> Commit {
        let inverter_unhealthy = reading.state.is_some_and(|state| state != 1)
            || reading.warning_info.is_some_and(|warning| warning != 0);
        if inverter_unhealthy {
            let mut state = self.state.lock();
            state.delta_kw = 0.0;
            state.last_update_ms = now_ms;
            return Commit::Alarm;
        }

        let import_kw = (-reading.psum_kw).max(0.0);
        let mut target = if import_kw > self.cfg.min_import_kw {
            import_kw
        } else {
            0.0
        };
        target = target.min(self.cfg.clamp_max_kw);

        let mut state = self.state.lock();
        let prev = state.delta_kw;
        let smoothing = self.cfg.smoothing_factor;
        let ema = if smoothing > 0.0 && smoothing < 1.0 {
            smoothing * target + (1.0 - smoothing) * prev
        } else {
            target
        };
        let step = self.cfg.delta_max_kw_per_sec * self.cfg.fetch_period_s as f64;
        let next = (prev + (ema - prev).clamp(-step, step)).clamp(0.0, self.cfg.clamp_max_kw);

        state.delta_kw = next;
        state.last_update_ms = now_ms;
        Commit::Updated { delta_kw: next }
    }

    /// Record a failed poll. Returns true when the state just went stale and
    /// a non-zero set-point had to be forced to 0.
    pub fn mark_failure(&self, now_ms: i64) -> bool {
        let mut state = self.state.lock();
        let stale =
            state.last_update_ms > 0 && now_ms - state.last_update_ms > self.cfg.max_data_age_ms;
        if stale && state.delta_kw != 0.0 {
            state.delta_kw = 0.0;
            return true;
        }
        false
    }

    /// Safety-gated set-point; 0 while disabled, never updated or stale.
    pub fn current_delta_kw(&self, now_ms: i64) -> f64 {
        if !self.cfg.override_enabled {
            return 0.0;
        }
        let state = self.state.lock();
        if state.last_update_ms == 0 || now_ms - state.last_update_ms > self.cfg.max_data_age_ms {
            return 0.0;
        }
        state.delta_kw
    }

    pub fn last_update_ms(&self) -> i64 {
        self.state.lock().last_update_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_cfg() -> CloudConfig {
        CloudConfig {
            api_id: String::new(),
            api_secret: String::new(),
            base_uri: "http://localhost".to_string(),
            sn: String::new(),
            fetch_period_s: 10,
            min_import_kw: 0.2,
            max_data_age_ms: 300_000,
            smoothing_factor: 0.8,
            clamp_max_kw: 50.0,
            delta_max_kw_per_sec: 2.0,
            override_enabled: true,
            request_timeout_ms: 6000,
            max_clock_skew_ms: 90_000,
        }
    }

    fn reading(psum_kw: f64) -> CloudReading {
        CloudReading {
            psum_kw,
            pac_kw: None,
            pv_kw: None,
            load_kw: None,
            state: Some(1),
            warning_info: Some(0),
            fetched_at_ms: 0,
        }
    }

    #[test]
    fn import_below_threshold_targets_zero() {
        let comp = Compensator::new(test_cfg());
        comp.apply_reading(&reading(-0.1), 1_000);
        assert_eq!(comp.current_delta_kw(1_000), 0.0);
    }

    #[test]
    fn export_never_compensates() {
        let comp = Compensator::new(test_cfg());
        comp.apply_reading(&reading(4.2), 1_000);
        assert_eq!(comp.current_delta_kw(1_000), 0.0);
    }

    #[test]
    fn ema_moves_toward_the_import() {
        let comp = Compensator::new(test_cfg());
        // 2.5 kW import from a standing start: 0.8 * 2.5 = 2.0 kW.
        let commit = comp.apply_reading(&reading(-2.5), 1_000);
        assert_eq!(commit, Commit::Updated { delta_kw: 2.0 });
        // Second sample converges further: 0.8 * 2.5 + 0.2 * 2.0 = 2.4.
        let commit = comp.apply_reading(&reading(-2.5), 11_000);
        assert_eq!(commit, Commit::Updated { delta_kw: 2.4 });
    }

    #[test]
    fn smoothing_disabled_tracks_target_directly() {
        let mut cfg = test_cfg();
        cfg.smoothing_factor = 1.0;
        let comp = Compensator::new(cfg);
        let commit = comp.apply_reading(&reading(-3.0), 1_000);
        assert_eq!(commit, Commit::Updated { delta_kw: 3.0 });
    }

    #[test]
    fn slew_limits_large_jumps() {
        let mut cfg = test_cfg();
        cfg.smoothing_factor = 1.0;
        cfg.delta_max_kw_per_sec = 0.1; // 1 kW per 10 s poll
        let comp = Compensator::new(cfg);
        let commit = comp.apply_reading(&reading(-30.0), 1_000);
        assert_eq!(commit, Commit::Updated { delta_kw: 1.0 });
        let commit = comp.apply_reading(&reading(-30.0), 11_000);
        assert_eq!(commit, Commit::Updated { delta_kw: 2.0 });
        // Shrinking is limited the same way.
        let commit = comp.apply_reading(&reading(0.0), 21_000);
        assert_eq!(commit, Commit::Updated { delta_kw: 1.0 });
    }

    #[test]
    fn clamp_bounds_the_set_point() {
        let mut cfg = test_cfg();
        cfg.smoothing_factor = 1.0;
        cfg.clamp_max_kw = 5.0;
        cfg.delta_max_kw_per_sec = 100.0;
        let comp = Compensator::new(cfg);
        let commit = comp.apply_reading(&reading(-30.0), 1_000);
        assert_eq!(commit, Commit::Updated { delta_kw: 5.0 });
    }

    #[test]
    fn alarm_state_forces_zero() {
        let comp = Compensator::new(test_cfg());
        comp.apply_reading(&reading(-5.0), 1_000);
        assert!(comp.current_delta_kw(1_000) > 0.0);

        let mut alarmed = reading(-5.0);
        alarmed.state = Some(3);
        alarmed.warning_info = Some(42);
        assert_eq!(comp.apply_reading(&alarmed, 11_000), Commit::Alarm);
        assert_eq!(comp.current_delta_kw(11_000), 0.0);
    }

    #[test]
    fn warning_alone_forces_zero() {
        let comp = Compensator::new(test_cfg());
        let mut warned = reading(-5.0);
        warned.warning_info = Some(7);
        assert_eq!(comp.apply_reading(&warned, 1_000), Commit::Alarm);
    }

    #[test]
    fn staleness_gates_the_reader() {
        let cfg = test_cfg();
        let max_age = cfg.max_data_age_ms;
        let comp = Compensator::new(cfg);
        comp.apply_reading(&reading(-5.0), 1_000);
        assert!(comp.current_delta_kw(1_000 + max_age) > 0.0);
        assert_eq!(comp.current_delta_kw(1_000 + max_age + 1), 0.0);
    }

    #[test]
    fn mark_failure_zeroes_only_once_stale() {
        let cfg = test_cfg();
        let max_age = cfg.max_data_age_ms;
        let comp = Compensator::new(cfg);
        comp.apply_reading(&reading(-5.0), 1_000);

        assert!(!comp.mark_failure(2_000));
        assert!(comp.mark_failure(1_000 + max_age + 1));
        // Already zero: no second transition.
        assert!(!comp.mark_failure(1_000 + max_age + 2));
    }

    #[test]
    fn never_updated_reader_returns_zero() {
        let comp = Compensator::new(test_cfg());
        assert_eq!(comp.current_delta_kw(1_000_000), 0.0);
        assert!(!comp.mark_failure(1_000_000));
    }

    #[test]
    fn override_disabled_gates_the_reader() {
        let mut cfg = test_cfg();
        cfg.override_enabled = false;
        let comp = Compensator::new(cfg);
        comp.apply_reading(&reading(-5.0), 1_000);
        assert_eq!(comp.current_delta_kw(1_000), 0.0);
    }

    proptest! {
        #[test]
        fn prop_slew_bound_holds(prev_import in 0.0f64..50.0, next_psum in -60.0f64..60.0) {
            let mut cfg = test_cfg();
            cfg.smoothing_factor = 1.0;
            let step = cfg.delta_max_kw_per_sec * cfg.fetch_period_s as f64;
            let comp = Compensator::new(cfg);
            comp.apply_reading(&reading(-prev_import), 1_000);
            let prev = comp.current_delta_kw(1_000);
            let commit = comp.apply_reading(&reading(next_psum), 11_000);
            let Commit::Updated { delta_kw } = commit else { panic!("no alarm expected") };
            prop_assert!((delta_kw - prev).abs() <= step + 1e-9);
        }

        #[test]
        fn prop_delta_always_within_clamp(psums in proptest::collection::vec(-100.0f64..100.0, 1..20)) {
            let cfg = test_cfg();
            let clamp = cfg.clamp_max_kw;
            let comp = Compensator::new(cfg);
            let mut now = 1_000;
            for psum in psums {
                comp.apply_reading(&reading(psum), now);
                let delta = comp.current_delta_kw(now);
                prop_assert!((0.0..=clamp).contains(&delta));
                now += 10_000;
            }
        }
    }
}
