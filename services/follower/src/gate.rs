//! Version gate: decides whether an artifact release is compatible with the
//! running engine.
//!
//! Requirements and reported versions each have a flavor. Keys ending in
//! `_semver` carry semantic versions on both sides; any other key is compared
//! by the flavor of its values. Values of different flavors never satisfy one
//! another, so a literal `26` never stands in for `0.26.0` and vice versa.

use artifactctl_oci::{ArtifactConfig, Requirement};
use semver::Version;
use thiserror::Error;
use tracing::debug;

use crate::versions::EngineVersions;

const SEMVER_SUFFIX: &str = "_semver";

/// An unmet requirement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompatibilityError {
    #[error("required version info not available: `{0}`")]
    Missing(String),

    #[error("requirement `{name}` wants {required}, engine reports {reported}")]
    Unmet {
        name: String,
        required: String,
        reported: String,
    },

    #[error("requirement `{name}` has invalid version `{value}`: {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Flavored {
    Semver(Version),
    Integer(u64),
    Literal(String),
}

impl Flavored {
    fn of(value: &str) -> Self {
        let value = value.trim();
        if let Ok(version) = Version::parse(value) {
            Self::Semver(version)
        } else if let Ok(n) = value.parse::<u64>() {
            Self::Integer(n)
        } else {
            Self::Literal(value.to_string())
        }
    }

    fn satisfies(&self, required: &Flavored) -> bool {
        match (self, required) {
            (Self::Semver(reported), Self::Semver(required)) => {
                reported.major == required.major && reported >= required
            }
            (Self::Integer(reported), Self::Integer(required)) => reported >= required,
            (Self::Literal(reported), Self::Literal(required)) => reported == required,
            _ => false,
        }
    }
}

/// Check every requirement of `config` against the engine's reported versions.
///
/// Stops at the first unmet requirement.
pub fn check_requirements(
    config: &ArtifactConfig,
    versions: &EngineVersions,
) -> Result<(), CompatibilityError> {
    for requirement in &config.requirements {
        check_requirement(requirement, versions)?;
    }
    Ok(())
}

fn check_requirement(
    requirement: &Requirement,
    versions: &EngineVersions,
) -> Result<(), CompatibilityError> {
    let name = &requirement.name;
    let reported = versions
        .get(name)
        .ok_or_else(|| CompatibilityError::Missing(name.clone()))?;

    let unmet = || CompatibilityError::Unmet {
        name: name.clone(),
        required: requirement.version.clone(),
        reported: reported.to_string(),
    };

    let required = Flavored::of(&requirement.version);
    let reported_flavor = Flavored::of(reported);

    if name.ends_with(SEMVER_SUFFIX) {
        if !matches!(required, Flavored::Semver(_)) {
            return Err(CompatibilityError::Invalid {
                name: name.clone(),
                value: requirement.version.clone(),
                reason: "expected a semantic version".to_string(),
            });
        }
        if !matches!(reported_flavor, Flavored::Semver(_)) {
            return Err(unmet());
        }
    }

    if !reported_flavor.satisfies(&required) {
        return Err(unmet());
    }
    debug!(requirement = %name, required = %requirement.version, reported = %reported, "Requirement satisfied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(name: &str, version: &str) -> ArtifactConfig {
        ArtifactConfig {
            name: "my_rule".to_string(),
            version: "0.1.0".to_string(),
            requirements: vec![Requirement {
                name: name.to_string(),
                version: version.to_string(),
            }],
            dependencies: vec![],
        }
    }

    fn versions(pairs: &[(&str, &str)]) -> EngineVersions {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    const NEW_ENGINE: &[(&str, &str)] = &[("engine_version_semver", "0.26.0"), ("engine_version", "26")];
    const OLD_ENGINE: &[(&str, &str)] = &[("engine_version", "26")];

    #[rstest]
    #[case::new_engine_semver_rules("engine_version_semver", "0.26.0", NEW_ENGINE, true)]
    #[case::new_engine_semver_key_int_value("engine_version_semver", "26", NEW_ENGINE, false)]
    #[case::old_engine_semver_rules("engine_version_semver", "0.26.0", OLD_ENGINE, false)]
    #[case::old_engine_semver_key_int_value("engine_version_semver", "26", OLD_ENGINE, false)]
    #[case::new_engine_int_rules("engine_version", "26", NEW_ENGINE, true)]
    #[case::new_engine_int_key_semver_value("engine_version", "0.26.0", NEW_ENGINE, false)]
    #[case::old_engine_int_rules("engine_version", "26", OLD_ENGINE, true)]
    #[case::old_engine_int_key_semver_value("engine_version", "0.26.0", OLD_ENGINE, false)]
    fn test_flavor_strictness(
        #[case] key: &str,
        #[case] required: &str,
        #[case] engine: &[(&str, &str)],
        #[case] compatible: bool,
    ) {
        let result = check_requirements(&config(key, required), &versions(engine));
        assert_eq!(result.is_ok(), compatible, "{result:?}");
    }

    #[rstest]
    #[case("0.26.0", "0.27.1", true)]
    #[case("0.26.0", "0.25.9", false)]
    #[case("1.2.0", "2.0.0", false)]
    #[case("1.2.0", "1.2.0", true)]
    fn test_semver_ordering(#[case] required: &str, #[case] reported: &str, #[case] ok: bool) {
        let result = check_requirements(
            &config("plugin_api_version_semver", required),
            &versions(&[("plugin_api_version_semver", reported)]),
        );
        assert_eq!(result.is_ok(), ok);
    }

    #[test]
    fn test_integer_and_literal_comparison() {
        let engine = versions(&[("engine_version", "27"), ("build", "release")]);
        assert!(check_requirements(&config("engine_version", "26"), &engine).is_ok());
        assert!(check_requirements(&config("engine_version", "28"), &engine).is_err());
        assert!(check_requirements(&config("build", "release"), &engine).is_ok());
        assert!(check_requirements(&config("build", "debug"), &engine).is_err());
    }

    #[test]
    fn test_missing_key() {
        let err = check_requirements(&config("plugin_api_version", "3.0.0"), &versions(OLD_ENGINE))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "required version info not available: `plugin_api_version`"
        );
    }

    #[test]
    fn test_no_requirements_always_pass() {
        assert!(check_requirements(&ArtifactConfig::default(), &EngineVersions::default()).is_ok());
    }

    #[test]
    fn test_first_unmet_short_circuits() {
        let mut config = config("engine_version", "99");
        config.requirements.push(Requirement {
            name: "missing".to_string(),
            version: "1".to_string(),
        });
        let err = check_requirements(&config, &versions(OLD_ENGINE)).unwrap_err();
        assert!(matches!(err, CompatibilityError::Unmet { name, .. } if name == "engine_version"));
    }
}
