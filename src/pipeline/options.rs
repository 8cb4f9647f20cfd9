//! The `tweak_option` token and the stage plan derived from it.
//!
//! The wire format stays a single string such as
//! `tweak_extended_volume_returntweaked`; it is parsed once into
//! [`TweakOption`] and every later decision works on that struct.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_TWEAK_OPTION: &str = "tweak_extended_volume_returntweaked";

const PREFIX: &str = "tweak_";
const KEEP: &str = "keep";
const EXTENDED: &str = "extended";
const SURFACE: &str = "surface";
const VOLUME: &str = "volume";
const RETURN_TWEAKED: &str = "returntweaked";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("Unrecognized tweak option '{0}'")]
    Unrecognized(String),
    #[error("Tweak option '{0}' asks for both surface and volume minimization")]
    ConflictingObjective(String),
}

/// What the tweak tool minimizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    Surface,
    #[default]
    Volume,
}

/// Parsed form of the `tweak_option` request field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TweakOption {
    /// `false` under `_keep`: the caller already oriented the mesh.
    pub do_tweak: bool,
    pub extended: bool,
    pub objective: Objective,
    pub return_tweaked: bool,
}

impl Default for TweakOption {
    fn default() -> Self {
        Self {
            do_tweak: true,
            extended: true,
            objective: Objective::Volume,
            return_tweaked: true,
        }
    }
}

impl FromStr for TweakOption {
    type Err = OptionError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let unrecognized = || OptionError::Unrecognized(token.to_string());
        let rest = token.strip_prefix(PREFIX).ok_or_else(unrecognized)?;
        if rest.is_empty() {
            return Err(unrecognized());
        }

        let parts: Vec<&str> = rest.split('_').collect();
        let mut option = TweakOption {
            do_tweak: true,
            extended: false,
            objective: Objective::Volume,
            return_tweaked: false,
        };
        let (mut surface, mut volume) = (false, false);
        for (index, part) in parts.iter().enumerate() {
            match *part {
                KEEP => option.do_tweak = false,
                EXTENDED => option.extended = true,
                SURFACE => surface = true,
                VOLUME => volume = true,
                RETURN_TWEAKED if index == parts.len() - 1 => option.return_tweaked = true,
                _ => return Err(unrecognized()),
            }
        }
        if surface && volume {
            return Err(OptionError::ConflictingObjective(token.to_string()));
        }
        if surface {
            option.objective = Objective::Surface;
        }
        Ok(option)
    }
}

impl fmt::Display for TweakOption {
    /// Canonical token; parsing it yields the same option.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(PREFIX)?;
        let mut parts = Vec::with_capacity(3);
        if self.extended {
            parts.push(EXTENDED);
        }
        if self.do_tweak {
            parts.push(match self.objective {
                Objective::Surface => SURFACE,
                Objective::Volume => VOLUME,
            });
        } else {
            parts.push(KEEP);
        }
        if self.return_tweaked {
            parts.push(RETURN_TWEAKED);
        }
        f.write_str(&parts.join("_"))
    }
}

/// One step of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Tweak,
    Slice,
    Relay,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Tweak => "tweak",
            Stage::Slice => "slice",
            Stage::Relay => "relay",
        };
        f.write_str(name)
    }
}

/// Tweak tool flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TweakSettings {
    pub extended: bool,
    pub objective: Objective,
}

/// Which stages one request runs. A pure function of the option, profile
/// presence and relay target presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StagePlan {
    pub tweak: Option<TweakSettings>,
    pub slice: bool,
    /// Send the (tweaked or kept) mesh to the relay target.
    pub relay_mesh: bool,
    /// Send the produced g-code to the relay target.
    pub relay_gcode: bool,
}

impl StagePlan {
    pub fn decide(option: &TweakOption, has_profile: bool, has_relay_target: bool) -> Self {
        let tweak = option.do_tweak.then_some(TweakSettings {
            extended: option.extended,
            objective: option.objective,
        });
        Self {
            tweak,
            slice: has_profile,
            relay_mesh: has_relay_target && option.return_tweaked,
            relay_gcode: has_relay_target && has_profile,
        }
    }

    pub fn relays(&self) -> bool {
        self.relay_mesh || self.relay_gcode
    }

    /// Stages in execution order.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = Vec::with_capacity(3);
        if self.tweak.is_some() {
            stages.push(Stage::Tweak);
        }
        if self.slice {
            stages.push(Stage::Slice);
        }
        if self.relays() {
            stages.push(Stage::Relay);
        }
        stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(token: &str) -> TweakOption {
        token.parse().unwrap()
    }

    #[test]
    fn test_default_token() {
        assert_eq!(parse(DEFAULT_TWEAK_OPTION), TweakOption::default());
    }

    #[test]
    fn test_parse_variants() {
        let opt = parse("tweak_surface");
        assert!(opt.do_tweak && !opt.extended && !opt.return_tweaked);
        assert_eq!(opt.objective, Objective::Surface);

        let opt = parse("tweak_extended_volume");
        assert!(opt.do_tweak && opt.extended);
        assert_eq!(opt.objective, Objective::Volume);

        let opt = parse("tweak_keep");
        assert!(!opt.do_tweak);

        let opt = parse("tweak_keep_returntweaked");
        assert!(!opt.do_tweak && opt.return_tweaked);

        // Volume is the default objective
        assert_eq!(parse("tweak_extended").objective, Objective::Volume);
    }

    #[test]
    fn test_reject_unknown_tokens() {
        for token in ["", "tweak_", "Tweak", "convert", "tweak_fast", "tweak_returntweaked_volume", "tweak__volume"] {
            assert!(
                matches!(token.parse::<TweakOption>(), Err(OptionError::Unrecognized(_))),
                "{token} should be rejected"
            );
        }
        assert!(matches!(
            "tweak_surface_volume".parse::<TweakOption>(),
            Err(OptionError::ConflictingObjective(_))
        ));
    }

    #[test]
    fn test_display_is_canonical() {
        for token in [
            "tweak_volume",
            "tweak_surface",
            "tweak_extended_volume_returntweaked",
            "tweak_extended_surface",
            "tweak_keep",
            "tweak_keep_returntweaked",
        ] {
            assert_eq!(parse(token).to_string(), token);
        }
    }

    #[test]
    fn test_decision_table() {
        let cases: &[(&str, bool, bool, &[Stage])] = &[
            ("tweak_extended_volume_returntweaked", false, true, &[Stage::Tweak, Stage::Relay]),
            ("tweak_extended_volume_returntweaked", false, false, &[Stage::Tweak]),
            ("tweak_keep", true, false, &[Stage::Slice]),
            ("tweak_keep", true, true, &[Stage::Slice, Stage::Relay]),
            ("tweak_keep", false, true, &[]),
            ("tweak_surface", true, false, &[Stage::Tweak, Stage::Slice]),
            ("tweak_volume", false, true, &[Stage::Tweak]),
            ("tweak_volume_returntweaked", true, true, &[Stage::Tweak, Stage::Slice, Stage::Relay]),
        ];
        for (token, profile, relay, expected) in cases {
            let plan = StagePlan::decide(&parse(token), *profile, *relay);
            assert_eq!(plan.stages(), expected.to_vec(), "{token} profile={profile} relay={relay}");
        }
    }

    #[test]
    fn test_relay_artifact_selection() {
        let plan = StagePlan::decide(&parse("tweak_volume_returntweaked"), true, true);
        assert!(plan.relay_mesh && plan.relay_gcode);
        let plan = StagePlan::decide(&parse("tweak_volume"), true, true);
        assert!(!plan.relay_mesh && plan.relay_gcode);
    }
}
