//! Tunables for the coordination core, the modelled radio link, and the simulator.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::WireFormat;
use crate::error::ConfigError;
use crate::types::Millis;

/// How conflicting roadside claims about the same zone and kind are merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorroborationPolicy {
    /// An active claim stands until the source that raised it clears it.
    #[default]
    SourceRetraction,
    /// An active claim is dropped only when a strict majority of reporting
    /// sources claim the zone is clear.
    Majority,
}

/// Per-agent protocol parameters. All agents at one intersection must agree
/// on the scheduling fields for their locally computed orders to converge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub detection_horizon_m: f64,
    pub negotiation_period_ms: Millis,
    pub staleness_age_ms: Millis,
    pub safety_margin_ms: Millis,
    pub starvation_deadline_ms: Millis,
    /// Entry-time bonus per millisecond waited past the deadline, in 1/1000.
    pub starvation_bonus_permille: u64,
    pub yield_timeout_ms: Millis,
    pub alert_corroboration: CorroborationPolicy,
    pub min_confidence: f64,
    pub min_negotiation_cycles: u32,
    pub commit_lead_ms: Millis,
    pub peer_forget_age_ms: Millis,
    /// 0 disables V2I silence detection.
    pub v2i_silence_timeout_ms: Millis,
    pub cleared_rebroadcasts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            detection_horizon_m: 35.0,
            negotiation_period_ms: 100,
            staleness_age_ms: 600,
            safety_margin_ms: 500,
            starvation_deadline_ms: 8_000,
            starvation_bonus_permille: 1_000,
            yield_timeout_ms: 3_000,
            alert_corroboration: CorroborationPolicy::SourceRetraction,
            min_confidence: 0.5,
            min_negotiation_cycles: 2,
            commit_lead_ms: 100,
            peer_forget_age_ms: 2_000,
            v2i_silence_timeout_ms: 1_500,
            cleared_rebroadcasts: 3,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.detection_horizon_m.is_finite() && self.detection_horizon_m > 0.0) {
            return Err(invalid("detection_horizon_m", "must be a positive distance"));
        }
        if self.negotiation_period_ms == 0 {
            return Err(invalid("negotiation_period_ms", "must be greater than 0"));
        }
        if self.staleness_age_ms < self.negotiation_period_ms {
            return Err(invalid(
                "staleness_age_ms",
                "must be at least one negotiation period",
            ));
        }
        if self.peer_forget_age_ms < self.staleness_age_ms {
            return Err(invalid(
                "peer_forget_age_ms",
                "must not be shorter than staleness_age_ms",
            ));
        }
        if self.yield_timeout_ms == 0 {
            return Err(invalid("yield_timeout_ms", "must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(invalid("min_confidence", "must be within [0, 1]"));
        }
        Ok(())
    }
}

/// Fault model of the broadcast medium.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkProfile {
    pub loss: f64,
    pub duplicate: f64,
    pub corrupt: f64,
    pub min_delay_ms: Millis,
    pub max_delay_ms: Millis,
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self {
            loss: 0.05,
            duplicate: 0.02,
            corrupt: 0.01,
            min_delay_ms: 5,
            max_delay_ms: 40,
        }
    }
}

impl LinkProfile {
    /// Perfect link: no loss, duplication, corruption, or delay.
    #[cfg(test)]
    pub fn ideal() -> Self {
        Self {
            loss: 0.0,
            duplicate: 0.0,
            corrupt: 0.0,
            min_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("link.loss", self.loss),
            ("link.duplicate", self.duplicate),
            ("link.corrupt", self.corrupt),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, "probability must be within [0, 1]"));
            }
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(invalid("link.min_delay_ms", "must not exceed max_delay_ms"));
        }
        Ok(())
    }
}

/// Simulator pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    pub seed: u64,
    /// Simulated milliseconds per wall-clock millisecond.
    pub speedup: u64,
    pub physics_step_ms: Millis,
    /// Simulated time after which a run is stopped regardless of progress.
    pub deadline_ms: Millis,
    pub wire_format: WireFormat,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 2432,
            speedup: 4,
            physics_step_ms: 20,
            deadline_ms: 60_000,
            wire_format: WireFormat::Binary,
        }
    }
}

/// Complete configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub coordinator: CoordinatorConfig,
    pub link: LinkProfile,
    pub simulation: SimulationConfig,
}

impl Settings {
    /// Load settings from a TOML file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coordinator.validate()?;
        self.link.validate()?;
        if self.simulation.speedup == 0 {
            return Err(invalid("simulation.speedup", "must be greater than 0"));
        }
        if self.simulation.physics_step_ms == 0 {
            return Err(invalid("simulation.physics_step_ms", "must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().expect("defaults must validate");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let settings = Settings::from_toml(
            r#"
            [coordinator]
            safety_margin_ms = 750
            alert_corroboration = "majority"

            [link]
            loss = 0.2
            "#,
        )
        .expect("parse");
        assert_eq!(settings.coordinator.safety_margin_ms, 750);
        assert_eq!(
            settings.coordinator.alert_corroboration,
            CorroborationPolicy::Majority
        );
        assert_eq!(settings.link.loss, 0.2);
        assert_eq!(
            settings.coordinator.negotiation_period_ms,
            CoordinatorConfig::default().negotiation_period_ms
        );
        assert_eq!(settings.simulation, SimulationConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Settings::from_toml("[coordinator]\nsafety_margin = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn out_of_range_probability_is_rejected() {
        let err = Settings::from_toml("[link]\nloss = 1.5\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "link.loss",
                ..
            }
        ));
    }

    #[test]
    fn staleness_shorter_than_period_is_rejected() {
        let err = Settings::from_toml(
            "[coordinator]\nnegotiation_period_ms = 200\nstaleness_age_ms = 100\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "staleness_age_ms",
                ..
            }
        ));
    }
}
