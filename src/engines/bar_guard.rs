//! Bar-Close Guard
//!
//! Every trading decision runs against a fully closed bar. The mandatory
//! checks (bar closure, OHLC integrity) always reject on failure; the
//! optional filters (tick noise, anti-FOMO) are disabled by default and the
//! anti-FOMO check never blocks, it only warns. Each rejection lands in an
//! in-memory audit log so the operator can answer "why was this bar
//! skipped" without re-reading the logs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::models::BarSeries;

/// One audited rejection.
#[derive(Debug, Clone)]
pub struct GuardRejection {
    pub timestamp: DateTime<Utc>,
    pub category: &'static str,
    pub reason: String,
}

/// Guard configuration and state snapshot, exposed for the UI.
#[derive(Debug, Clone)]
pub struct GuardStatus {
    pub min_pips_movement: f64,
    pub anti_fomo_bars: i64,
    pub noise_filter_enabled: bool,
    pub anti_fomo_enabled: bool,
    pub last_signal_bar: Option<i64>,
    pub total_rejections: usize,
    pub rejections_by_category: HashMap<&'static str, usize>,
}

pub struct BarCloseGuard {
    min_pips_movement: f64,
    anti_fomo_bars: i64,
    enable_noise_filter: bool,
    enable_anti_fomo: bool,
    last_signal_bar: Option<i64>,
    rejections: Vec<GuardRejection>,
}

impl BarCloseGuard {
    pub fn new(
        min_pips_movement: f64,
        anti_fomo_bars: i64,
        enable_noise_filter: bool,
        enable_anti_fomo: bool,
    ) -> Self {
        Self {
            min_pips_movement,
            anti_fomo_bars,
            enable_noise_filter,
            enable_anti_fomo,
            last_signal_bar: None,
            rejections: Vec::new(),
        }
    }

    /// Both optional filters off; mandatory checks only.
    pub fn disabled_filters() -> Self {
        Self::new(0.5, 1, false, false)
    }

    /// MANDATORY: OHLC integrity of the bar at `index`.
    ///
    /// Requires at least two bars (current forming + one closed), the index
    /// in range, all OHLC fields finite, and logical consistency
    /// (`high >= open, close`; `low <= open, close`; `high >= low`).
    pub fn validate_bar_state(&mut self, series: &BarSeries, index: usize) -> Result<(), String> {
        let result = Self::check_bar_state(series, index);
        if let Err(reason) = &result {
            self.log_rejection("bar-state", reason.clone());
        }
        result
    }

    fn check_bar_state(series: &BarSeries, index: usize) -> Result<(), String> {
        if series.is_empty() {
            return Err("bar series is empty".to_string());
        }
        if series.len() < 2 {
            return Err("insufficient bars: need 2+ (current forming + 1 closed)".to_string());
        }
        let bar = series
            .get(index)
            .ok_or_else(|| format!("bar index {} exceeds data range (length={})", index, series.len()))?;
        if !bar.ohlc_finite() {
            return Err(format!(
                "non-finite OHLC: O={} H={} L={} C={}",
                bar.open, bar.high, bar.low, bar.close
            ));
        }
        if bar.high < bar.low {
            return Err(format!("invalid OHLC: high ({}) < low ({})", bar.high, bar.low));
        }
        if bar.high < bar.open {
            return Err(format!("invalid OHLC: high ({}) < open ({})", bar.high, bar.open));
        }
        if bar.high < bar.close {
            return Err(format!("invalid OHLC: high ({}) < close ({})", bar.high, bar.close));
        }
        if bar.low > bar.open {
            return Err(format!("invalid OHLC: low ({}) > open ({})", bar.low, bar.open));
        }
        if bar.low > bar.close {
            return Err(format!("invalid OHLC: low ({}) > close ({})", bar.low, bar.close));
        }
        Ok(())
    }

    /// MANDATORY: a bar is closed once a full timeframe has elapsed since it
    /// opened. Equality counts as closed.
    pub fn is_bar_closed(
        now: DateTime<Utc>,
        bar_open_time: DateTime<Utc>,
        timeframe_minutes: i64,
    ) -> Result<bool, String> {
        if now <= bar_open_time {
            return Err(format!(
                "invalid times: current ({}) not after bar open ({})",
                now, bar_open_time
            ));
        }
        let elapsed = now - bar_open_time;
        Ok(elapsed.num_seconds() >= timeframe_minutes * 60)
    }

    /// OPTIONAL: tick-noise filter. Disabled means always pass, with a
    /// reason explaining that the filter was not evaluated.
    pub fn filter_tick_noise(&mut self, movement_pips: f64) -> (bool, String) {
        if !self.enable_noise_filter {
            return (
                true,
                format!(
                    "noise filter disabled (movement: {:.2} pips), not evaluated",
                    movement_pips
                ),
            );
        }
        if movement_pips.abs() >= self.min_pips_movement {
            (
                true,
                format!(
                    "significant movement: {:.2} pips >= threshold {:.2}",
                    movement_pips, self.min_pips_movement
                ),
            )
        } else {
            let reason = format!(
                "tick noise: {:.2} pips < threshold {:.2}",
                movement_pips.abs(),
                self.min_pips_movement
            );
            warn!(%reason, "entry blocked by noise filter");
            self.log_rejection("tick-noise", reason.clone());
            (false, reason)
        }
    }

    /// OPTIONAL: anti-FOMO cooldown. Advisory only: logs a warning when the
    /// entry is too close to the previous signal but ALWAYS allows it.
    pub fn check_anti_fomo(&mut self, bar_index: i64) -> (bool, String) {
        if !self.enable_anti_fomo {
            return (true, "anti-FOMO disabled, not evaluated".to_string());
        }
        let Some(last) = self.last_signal_bar else {
            return (true, "no previous signal, first entry allowed".to_string());
        };
        let bars_since = bar_index - last;
        if bars_since < self.anti_fomo_bars {
            let reason = format!(
                "anti-FOMO warning: {} bar(s) since last signal (cooldown: {})",
                bars_since, self.anti_fomo_bars
            );
            warn!(%reason, "rapid re-entry");
            self.log_rejection("anti-fomo-warning", reason.clone());
            (true, reason)
        } else {
            (
                true,
                format!(
                    "anti-FOMO ok: {} bar(s) >= cooldown ({})",
                    bars_since, self.anti_fomo_bars
                ),
            )
        }
    }

    /// Record an emitted signal for anti-FOMO tracking.
    pub fn record_signal(&mut self, bar_index: i64) {
        self.last_signal_bar = Some(bar_index);
        debug!(bar_index, "signal recorded");
    }

    /// Full entry validation: mandatory bar state, then advisory anti-FOMO,
    /// then the noise filter (blocking only when enabled). Returns the
    /// combined reason trail.
    pub fn validate_entry(
        &mut self,
        series: &BarSeries,
        bar_index: usize,
        movement_pips: Option<f64>,
    ) -> (bool, String) {
        let mut trail = Vec::new();

        match self.validate_bar_state(series, bar_index) {
            Ok(()) => trail.push("[mandatory] bar state: ok".to_string()),
            Err(reason) => {
                trail.push(format!("[mandatory] bar state: {}", reason));
                return (false, trail.join(" | "));
            }
        }

        let (_, fomo_reason) = self.check_anti_fomo(bar_index as i64);
        trail.push(format!("[optional] anti-FOMO: {}", fomo_reason));

        if let Some(pips) = movement_pips {
            let (noise_ok, noise_reason) = self.filter_tick_noise(pips);
            trail.push(format!("[optional] noise filter: {}", noise_reason));
            if !noise_ok {
                return (false, trail.join(" | "));
            }
        }

        (true, trail.join(" | "))
    }

    fn log_rejection(&mut self, category: &'static str, reason: String) {
        debug!(category, %reason, "guard rejection");
        self.rejections.push(GuardRejection {
            timestamp: Utc::now(),
            category,
            reason,
        });
    }

    pub fn rejection_summary(&self) -> HashMap<&'static str, usize> {
        let mut summary = HashMap::new();
        for entry in &self.rejections {
            *summary.entry(entry.category).or_insert(0) += 1;
        }
        summary
    }

    pub fn rejections(&self) -> &[GuardRejection] {
        &self.rejections
    }

    pub fn status(&self) -> GuardStatus {
        GuardStatus {
            min_pips_movement: self.min_pips_movement,
            anti_fomo_bars: self.anti_fomo_bars,
            noise_filter_enabled: self.enable_noise_filter,
            anti_fomo_enabled: self.enable_anti_fomo,
            last_signal_bar: self.last_signal_bar,
            total_rejections: self.rejections.len(),
            rejections_by_category: self.rejection_summary(),
        }
    }

    pub fn reset_rejections(&mut self) {
        self.rejections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Bar;
    use chrono::TimeZone;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            time: Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            tick_volume: None,
            ema50: 2000.0,
            ema200: 1995.0,
            atr14: 5.0,
        }
    }

    fn valid_series() -> BarSeries {
        BarSeries::new(vec![
            bar(2000.0, 2010.0, 1990.0, 2005.0),
            bar(2005.0, 2012.0, 2001.0, 2010.0),
        ])
    }

    #[test]
    fn valid_bar_passes() {
        let mut guard = BarCloseGuard::disabled_filters();
        assert!(guard.validate_bar_state(&valid_series(), 0).is_ok());
    }

    #[test]
    fn single_bar_series_rejected() {
        let mut guard = BarCloseGuard::disabled_filters();
        let series = BarSeries::new(vec![bar(2000.0, 2010.0, 1990.0, 2005.0)]);
        assert!(guard.validate_bar_state(&series, 0).is_err());
        assert_eq!(guard.rejection_summary().get("bar-state"), Some(&1));
    }

    #[test]
    fn high_below_close_rejected() {
        let mut guard = BarCloseGuard::disabled_filters();
        let series = BarSeries::new(vec![
            bar(2000.0, 2001.0, 1990.0, 2005.0),
            bar(2005.0, 2012.0, 2001.0, 2010.0),
        ]);
        let err = guard.validate_bar_state(&series, 0).unwrap_err();
        assert!(err.contains("high"));
    }

    #[test]
    fn nan_close_rejected() {
        let mut guard = BarCloseGuard::disabled_filters();
        let series = BarSeries::new(vec![
            bar(2000.0, 2010.0, 1990.0, f64::NAN),
            bar(2005.0, 2012.0, 2001.0, 2010.0),
        ]);
        assert!(guard.validate_bar_state(&series, 0).is_err());
    }

    #[test]
    fn bar_closed_at_exact_boundary() {
        let open = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
        let exactly_one_hour = Utc.with_ymd_and_hms(2024, 1, 2, 11, 0, 0).unwrap();
        assert!(BarCloseGuard::is_bar_closed(exactly_one_hour, open, 60).unwrap());

        let one_minute_short = Utc.with_ymd_and_hms(2024, 1, 2, 10, 59, 0).unwrap();
        assert!(!BarCloseGuard::is_bar_closed(one_minute_short, open, 60).unwrap());
    }

    #[test]
    fn bar_closed_rejects_inverted_times() {
        let open = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();
        assert!(BarCloseGuard::is_bar_closed(before, open, 60).is_err());
    }

    #[test]
    fn noise_filter_disabled_never_blocks() {
        let mut guard = BarCloseGuard::disabled_filters();
        let (ok, reason) = guard.filter_tick_noise(0.01);
        assert!(ok);
        assert!(reason.contains("not evaluated"));
    }

    #[test]
    fn noise_filter_enabled_blocks_micro_moves() {
        let mut guard = BarCloseGuard::new(5.0, 1, true, false);
        let (ok, _) = guard.filter_tick_noise(2.0);
        assert!(!ok);
        let (ok, _) = guard.filter_tick_noise(5.0);
        assert!(ok);
        assert_eq!(guard.rejection_summary().get("tick-noise"), Some(&1));
    }

    #[test]
    fn anti_fomo_warns_but_allows() {
        let mut guard = BarCloseGuard::new(0.5, 3, false, true);
        guard.record_signal(10);
        let (ok, reason) = guard.check_anti_fomo(11);
        assert!(ok);
        assert!(reason.contains("anti-FOMO warning"));
        let (ok, reason) = guard.check_anti_fomo(13);
        assert!(ok);
        assert!(reason.contains("ok"));
    }

    #[test]
    fn validate_entry_combines_checks() {
        let mut guard = BarCloseGuard::new(5.0, 1, true, true);
        let (ok, trail) = guard.validate_entry(&valid_series(), 0, Some(10.0));
        assert!(ok);
        assert!(trail.contains("bar state: ok"));
        assert!(trail.contains("noise filter"));

        let (ok, trail) = guard.validate_entry(&valid_series(), 0, Some(1.0));
        assert!(!ok);
        assert!(trail.contains("tick noise"));
    }
}
