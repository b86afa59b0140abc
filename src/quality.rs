use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::QualityConfig;
use crate::schema::{CheckStatus, CombinedRecord, QualityCheckResult};

/// Upper bound on retained price points.
const MAX_POINTS: usize = 4_096;

/// In-process data quality checks over delivered cycles.
///
/// Tracks:
/// - the timestamp of the latest delivered record
/// - a bounded window of (timestamp, price_usd) points
///
/// Checks mirror what the downstream monitor runs against the
/// analytical store, so a collector-side FAIL predicts a store-side one.
pub struct QualityMonitor {
    cfg: QualityConfig,
    last_delivery: Option<DateTime<Utc>>,
    prices: VecDeque<(DateTime<Utc>, f64)>,
    delivered: u64,
}

impl QualityMonitor {
    pub fn new(cfg: QualityConfig) -> Self {
        Self {
            cfg,
            last_delivery: None,
            prices: VecDeque::new(),
            delivered: 0,
        }
    }

    /// Records one delivered cycle.
    ///
    /// Records with an unparsable timestamp are ignored.
    pub fn observe(&mut self, record: &CombinedRecord) {
        let Ok(ts) = DateTime::parse_from_rfc3339(&record.timestamp) else {
            log::debug!("quality: skipping record with timestamp '{}'", record.timestamp);
            return;
        };
        let ts = ts.with_timezone(&Utc);

        self.delivered += 1;
        self.last_delivery = Some(self.last_delivery.map_or(ts, |prev| prev.max(ts)));

        if let Some(price) = record.price() {
            self.prices.push_back((ts, price.price_usd));
        }

        if let Some(horizon) = window_start(ts, self.retention_minutes()) {
            while self.prices.front().is_some_and(|(t, _)| *t < horizon) {
                self.prices.pop_front();
            }
        }
        while self.prices.len() > MAX_POINTS {
            self.prices.pop_front();
        }
    }

    /// True after every `every_cycles` delivered cycles (never when 0).
    pub fn due(&self) -> bool {
        self.cfg.every_cycles > 0 && self.delivered > 0 && self.delivered % self.cfg.every_cycles == 0
    }

    pub fn evaluate(&self, now: DateTime<Utc>) -> Vec<QualityCheckResult> {
        vec![
            self.check_freshness(now),
            self.check_completeness(now),
            self.check_consistency(now),
        ]
    }

    fn retention_minutes(&self) -> i64 {
        self.cfg
            .completeness_window_minutes
            .max(self.cfg.consistency_window_minutes)
            .max(self.cfg.max_age_minutes)
    }

    fn check_freshness(&self, now: DateTime<Utc>) -> QualityCheckResult {
        let Some(latest) = self.last_delivery else {
            return QualityCheckResult::new(
                "freshness",
                CheckStatus::Error,
                "No data delivered yet.".into(),
            );
        };

        let minutes_old = (now - latest).num_milliseconds() as f64 / 60_000.0;
        let status = if minutes_old <= self.cfg.max_age_minutes as f64 {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        };

        QualityCheckResult::new(
            "freshness",
            status,
            format!("Data is {:.2} minutes old.", minutes_old),
        )
    }

    fn check_completeness(&self, now: DateTime<Utc>) -> QualityCheckResult {
        let start = window_start(now, self.cfg.completeness_window_minutes);
        let count = self
            .prices
            .iter()
            .filter(|(t, _)| start.is_none_or(|s| *t > s))
            .count();

        let status = if count >= 1 {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        };

        QualityCheckResult::new(
            "completeness",
            status,
            format!(
                "Expected at least 1 price record in the last {} minutes, found {}.",
                self.cfg.completeness_window_minutes, count
            ),
        )
    }

    fn check_consistency(&self, now: DateTime<Utc>) -> QualityCheckResult {
        let start = window_start(now, self.cfg.consistency_window_minutes);
        let recent: Vec<f64> = self
            .prices
            .iter()
            .filter(|(t, _)| start.is_none_or(|s| *t > s))
            .map(|(_, p)| *p)
            .collect();

        // change is measured against the earlier point of each pair
        let anomalies = recent
            .windows(2)
            .filter(|pair| (pair[1] - pair[0]).abs() > pair[0] * self.cfg.max_change_ratio)
            .count();

        let status = if anomalies == 0 {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        };

        QualityCheckResult::new(
            "consistency",
            status,
            format!(
                "Found {} price anomalies in the last {} minutes.",
                anomalies, self.cfg.consistency_window_minutes
            ),
        )
    }
}

/// `end - minutes`, or `None` when the window reaches past the
/// representable range (the window is then unbounded).
fn window_start(end: DateTime<Utc>, minutes: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_minutes(minutes).and_then(|window| end.checked_sub_signed(window))
}
