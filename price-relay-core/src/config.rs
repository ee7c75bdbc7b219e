use crate::error::ConfigError;
use crate::types::{PriceConfig, UpdateThresholds};
use anyhow::{Context, Result};
use std::{collections::HashSet, fs, path::Path};
use tracing::debug;

/// Loads and parses the price configuration YAML file.
///
/// Feed ids are normalized while parsing. Ids and aliases must be unique and
/// every threshold must be positive.
pub fn load_price_config(path: impl AsRef<Path>) -> Result<Vec<PriceConfig>> {
    let path_ref = path.as_ref();
    debug!(path = %path_ref.display(), "Loading price config file");

    let yaml_content = fs::read_to_string(path_ref)
        .with_context(|| format!("Failed to read price config file: {}", path_ref.display()))?;

    parse_price_config(&yaml_content)
        .with_context(|| format!("Invalid price config file: {}", path_ref.display()))
}

pub fn parse_price_config(yaml: &str) -> Result<Vec<PriceConfig>> {
    let price_configs: Vec<PriceConfig> =
        serde_yaml::from_str(yaml).context("Failed to parse price config YAML")?;

    let mut unique_ids = HashSet::new();
    let mut unique_aliases = HashSet::new();

    for config in &price_configs {
        if !unique_ids.insert(config.id) {
            anyhow::bail!(
                "Duplicate price feed ID: {} (alias: {})",
                config.id,
                config.alias
            );
        }
        if !unique_aliases.insert(config.alias.clone()) {
            anyhow::bail!(
                "Duplicate price feed alias: {} (id: {})",
                config.alias,
                config.id
            );
        }

        validate_thresholds(&config.alias, &config.thresholds())?;
        if let Some(early) = &config.early_update {
            if early.time_difference_threshold == Some(0) {
                return Err(invalid(&config.alias, "early time_difference must be > 0").into());
            }
            for pct in [
                early.price_deviation_threshold_pct,
                early.confidence_ratio_threshold_pct,
            ]
            .into_iter()
            .flatten()
            {
                check_pct(&config.alias, "early percentage threshold", pct)?;
            }
        }
    }

    debug!(
        count = price_configs.len(),
        "Successfully loaded and validated price configs"
    );
    Ok(price_configs)
}

/// Rejects zero, negative and non-finite thresholds.
pub fn validate_thresholds(alias: &str, thresholds: &UpdateThresholds) -> Result<(), ConfigError> {
    if thresholds.time_difference == 0 {
        return Err(invalid(alias, "time_difference must be > 0"));
    }
    check_pct(alias, "price_deviation", thresholds.price_deviation_pct)?;
    check_pct(alias, "confidence_ratio", thresholds.confidence_ratio_pct)
}

fn check_pct(alias: &str, name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(alias, &format!("{} must be a positive number, got {}", name, value)))
    }
}

fn invalid(alias: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidThreshold {
        alias: alias.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EarlyUpdateConfig, FeedId};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(yaml: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", yaml).unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let file = write_config(
            r#"
- alias: BTC/USD
  id: 0xabcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890
  time_difference: 60
  price_deviation: 0.5
  confidence_ratio: 1.0
- alias: ETH/USD
  id: FEDCBA0987654321fedcba0987654321fedcba0987654321fedcba0987654321
  time_difference: 120
  price_deviation: 1.0
  confidence_ratio: 1.5
  early_update:
    time_difference: 30
    price_deviation: 0.1
"#,
        );

        let configs = load_price_config(file.path()).unwrap();

        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].alias, "BTC/USD");
        assert_eq!(
            configs[0].id.to_hex(),
            "abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890"
        );
        assert_eq!(configs[0].time_difference_threshold, 60);
        assert_eq!(configs[0].price_deviation_threshold_pct, 0.5);
        assert_eq!(configs[0].confidence_ratio_threshold_pct, 1.0);
        assert_eq!(configs[0].early_update, None);

        let eth: FeedId = "fedcba0987654321fedcba0987654321fedcba0987654321fedcba0987654321"
            .parse()
            .unwrap();
        assert_eq!(configs[1].id, eth);
        assert_eq!(
            configs[1].early_update,
            Some(EarlyUpdateConfig {
                time_difference_threshold: Some(30),
                price_deviation_threshold_pct: Some(0.1),
                confidence_ratio_threshold_pct: None,
            })
        );
    }

    #[test]
    fn test_load_duplicate_id() {
        let file = write_config(
            r#"
- alias: BTC/USD
  id: 0xabcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890
  time_difference: 60
  price_deviation: 0.5
  confidence_ratio: 1.0
- alias: BTC2/USD
  id: abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890
  time_difference: 120
  price_deviation: 1.0
  confidence_ratio: 1.5
"#,
        );

        let err = load_price_config(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Duplicate price feed ID"));
    }

    #[test]
    fn test_load_duplicate_alias() {
        let file = write_config(
            r#"
- alias: BTC/USD
  id: 0xabcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890
  time_difference: 60
  price_deviation: 0.5
  confidence_ratio: 1.0
- alias: BTC/USD
  id: 0xfedcba0987654321fedcba0987654321fedcba0987654321fedcba0987654321
  time_difference: 120
  price_deviation: 1.0
  confidence_ratio: 1.5
"#,
        );

        let err = load_price_config(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Duplicate price feed alias"));
    }

    #[test]
    fn test_load_invalid_id_format() {
        let file = write_config(
            r#"
- alias: BTC/USD
  id: 0xinvalidhex
  time_difference: 60
  price_deviation: 0.5
  confidence_ratio: 1.0
"#,
        );

        let err = load_price_config(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("invalid feed id length"));
    }

    #[test]
    fn test_load_missing_field() {
        let file = write_config(
            r#"
- alias: BTC/USD
  id: 0xabcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890
  price_deviation: 0.5
  confidence_ratio: 1.0
"#,
        );

        let err = load_price_config(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("missing field `time_difference`"));
    }

    #[test]
    fn test_load_rejects_non_positive_thresholds() {
        let zero_deviation = r#"
- alias: BTC/USD
  id: 0xabcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890
  time_difference: 60
  price_deviation: 0
  confidence_ratio: 1.0
"#;
        let err = parse_price_config(zero_deviation).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidThreshold { alias, .. }) if alias == "BTC/USD"
        ));

        let zero_time = zero_deviation
            .replace("time_difference: 60", "time_difference: 0")
            .replace("price_deviation: 0\n", "price_deviation: 1\n");
        assert!(parse_price_config(&zero_time).is_err());
    }

    #[test]
    fn test_validate_thresholds_rejects_nan() {
        let thresholds = UpdateThresholds {
            time_difference: 10,
            price_deviation_pct: f64::NAN,
            confidence_ratio_pct: 1.0,
        };
        assert!(validate_thresholds("X", &thresholds).is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_price_config("/nonexistent/price-config.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/price-config.yaml"));
    }
}
