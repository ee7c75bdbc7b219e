use crate::types::{FeedId, Observation, PriceConfig, UpdateCondition, UpdateThresholds};
use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use tracing::{debug, info};

/// Signals derived from a source/target pair, compared against thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Staleness {
    pub time_difference: i64,
    pub price_deviation_pct: f64,
    pub confidence_ratio_pct: f64,
}

impl Staleness {
    /// Computes the three signals. A zero target price yields an infinite
    /// deviation (unless the source is zero too), and a zero source price
    /// yields an infinite confidence ratio (unless conf is zero too).
    pub fn between(source: &Observation, target: &Observation) -> Self {
        let time_difference = source.publish_time - target.publish_time;

        let source_price = BigDecimal::from(source.price);
        let source_conf = BigDecimal::from(source.conf);
        let target_price = BigDecimal::from(target.price);

        let price_deviation_pct = if !target_price.is_zero() {
            ((&source_price - &target_price).abs() / target_price.abs() * BigDecimal::from(100))
                .to_f64()
                .unwrap_or(f64::INFINITY)
        } else if !source_price.is_zero() {
            f64::INFINITY
        } else {
            0.0
        };

        let confidence_ratio_pct = if !source_price.is_zero() {
            (source_conf / source_price.abs() * BigDecimal::from(100))
                .to_f64()
                .unwrap_or(f64::INFINITY)
        } else if !source_conf.is_zero() {
            f64::INFINITY
        } else {
            0.0
        };

        Self {
            time_difference,
            price_deviation_pct,
            confidence_ratio_pct,
        }
    }

    fn exceeds(&self, thresholds: &UpdateThresholds) -> bool {
        self.age_reaches(thresholds.time_difference)
            || self.price_deviation_pct >= thresholds.price_deviation_pct
            || self.confidence_ratio_pct >= thresholds.confidence_ratio_pct
    }

    /// Thresholds beyond `i64::MAX` seconds are never reached.
    fn age_reaches(&self, threshold: u64) -> bool {
        i64::try_from(threshold).is_ok_and(|threshold| self.time_difference >= threshold)
    }
}

/// Checks whether the target value is stale enough to push `source`.
///
/// * No target yet: always update.
/// * Source not strictly newer than target: never update.
/// * Otherwise: update if any of the three signals reaches its threshold.
pub fn should_update(
    source: &Observation,
    target: Option<&Observation>,
    thresholds: &UpdateThresholds,
) -> bool {
    let target = match target {
        Some(target) => target,
        None => return true,
    };

    if source.publish_time <= target.publish_time {
        return false;
    }

    Staleness::between(source, target).exceeds(thresholds)
}

/// Full update check for a configured feed, including early-update thresholds.
pub fn evaluate(
    price_config: &PriceConfig,
    source: Option<&Observation>,
    target: Option<&Observation>,
) -> UpdateCondition {
    let feed_id: &FeedId = &price_config.id;
    let alias = &price_config.alias;

    let source = match source {
        Some(source) => source,
        None => {
            debug!(%feed_id, %alias, "No source price available. Cannot determine update condition.");
            return UpdateCondition::No;
        }
    };

    let target = match target {
        Some(target) => target,
        None => {
            info!(%feed_id, %alias, "Price feed not found on target chain. Update required.");
            return UpdateCondition::Yes;
        }
    };

    if source.publish_time <= target.publish_time {
        debug!(
            %feed_id,
            %alias,
            source_time = source.publish_time,
            target_time = target.publish_time,
            "Source price is not newer than target price. No update needed."
        );
        return UpdateCondition::No;
    }

    let staleness = Staleness::between(source, target);
    let thresholds = price_config.thresholds();

    debug!(
        %feed_id,
        %alias,
        source_time = source.publish_time,
        target_time = target.publish_time,
        time_diff = staleness.time_difference,
        time_diff_thresh = thresholds.time_difference,
        price_dev_pct = format!("{:.5}", staleness.price_deviation_pct),
        price_dev_thresh = thresholds.price_deviation_pct,
        conf_ratio_pct = format!("{:.5}", staleness.confidence_ratio_pct),
        conf_ratio_thresh = thresholds.confidence_ratio_pct,
        "Calculated update check values"
    );

    if staleness.exceeds(&thresholds) {
        info!(%feed_id, %alias, "Main update condition met.");
        return UpdateCondition::Yes;
    }

    let early = match &price_config.early_update {
        Some(early) => early,
        None => return UpdateCondition::No,
    };

    let early_time = early
        .time_difference_threshold
        .is_some_and(|t| staleness.age_reaches(t));
    let early_price = early
        .price_deviation_threshold_pct
        .is_some_and(|p| staleness.price_deviation_pct >= p);
    let early_conf = early
        .confidence_ratio_threshold_pct
        .is_some_and(|c| staleness.confidence_ratio_pct >= c);

    if early_time || early_price || early_conf {
        debug!(%feed_id, %alias, "Early update condition met.");
        UpdateCondition::Early
    } else {
        debug!(%feed_id, %alias, "No update condition met (including early).");
        UpdateCondition::No
    }
}
