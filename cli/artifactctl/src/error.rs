//! Error display for the CLI.

use artifactctl_follower::{CompatibilityError, FollowError};
use artifactctl_index::IndexError;
use artifactctl_oci::{OciError, SignatureError};
use colored::Colorize;

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    if let Some(hint) = hint(err) {
        eprintln!("\n{}", format!("Hint: {hint}").yellow());
    }
}

fn hint(err: &anyhow::Error) -> Option<&'static str> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<FollowError>() {
            return match e {
                FollowError::Index(e) => index_hint(e),
                FollowError::Oci(e) => oci_hint(e),
                FollowError::Signature { .. } => Some(
                    "Keyless signatures cannot be verified; use --no-verify to skip verification.",
                ),
                FollowError::Versions(_) => Some(
                    "Check --versions; it must point at the engine's version endpoint or a JSON file.",
                ),
                _ => None,
            };
        }
        if let Some(e) = cause.downcast_ref::<IndexError>() {
            return index_hint(e);
        }
        if let Some(e) = cause.downcast_ref::<OciError>() {
            return oci_hint(e);
        }
        if cause.downcast_ref::<SignatureError>().is_some() {
            return Some("The artifact could not be verified. Nothing was installed.");
        }
        if cause.downcast_ref::<CompatibilityError>().is_some() {
            return Some("Pick an artifact version compatible with the running engine.");
        }
        None
    })
}

fn index_hint(err: &IndexError) -> Option<&'static str> {
    err.is_not_found().then_some(
        "Run `artifactctl index list` to see the names known to the configured indexes.",
    )
}

fn oci_hint(err: &OciError) -> Option<&'static str> {
    match err {
        OciError::AuthRequired(_) => {
            Some("Pass credentials with --registry-credentials host=user:password.")
        }
        OciError::PlatformNotFound { .. } => {
            Some("Use --platform to pick one of the published platforms.")
        }
        OciError::Http { .. } => {
            Some("Check the registry address; use --plain-http for registries without TLS.")
        }
        OciError::Signature(_) => {
            Some("The artifact could not be verified. Nothing was installed.")
        }
        _ => None,
    }
}
