//! Artifact file names.
//!
//! Every function here is pure: the derived names depend only on their
//! arguments.

/// Infix OctoPrint puts into names of files it is still uploading.
const OCTOPRINT_TMP_INFIX: &str = ".tmp.";
const TWEAKED_SUFFIX: &str = "_tweaked";
const SLICED_SUFFIX: &str = "_withPPS";
const GCODE_EXTENSION: &str = "gcode";
const TEMP_PROFILE_PREFIX: &str = "slicing-profile-temp";
const TEMP_PROFILE_SUFFIX: &str = ".profile";

/// Reduce an uploaded name to a safe plain file name.
///
/// Directory components are dropped, whitespace becomes `_`, anything but
/// ASCII alphanumerics, `-`, `_` and `.` is removed, and leading dots or
/// underscores are trimmed. Returns `None` when nothing usable is left.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    let trimmed = cleaned.trim_start_matches(['.', '_']);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Split `name` into stem and extension at the last dot.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

/// Whether the extension is one of `allowed` (case-insensitive).
pub fn allowed_file(name: &str, allowed: &[String]) -> bool {
    match split_extension(name) {
        (_, Some(ext)) => allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)),
        _ => false,
    }
}

/// `<stem>_tweaked.<ext>`.
///
/// Files forwarded by OctoPrint are named `<name>.tmp.<random>.<ext>`; the
/// temporary part is cut off first.
pub fn tweaked_name(original: &str, from_octoprint: bool) -> String {
    let (stem, ext) = split_extension(original);
    let stem = if from_octoprint {
        original
            .split_once(OCTOPRINT_TMP_INFIX)
            .map(|(head, _)| head)
            .unwrap_or(stem)
    } else {
        stem
    };
    match ext {
        Some(ext) => format!("{stem}{TWEAKED_SUFFIX}.{ext}"),
        None => format!("{stem}{TWEAKED_SUFFIX}"),
    }
}

/// The caller's name if given, else `<slicer-input-stem>_withPPS.gcode`.
pub fn sliced_name(slicer_input: &str, override_name: Option<&str>) -> String {
    if let Some(name) = override_name.filter(|n| !n.trim().is_empty()) {
        return name.to_string();
    }
    let (stem, _) = split_extension(slicer_input);
    format!("{stem}{SLICED_SUFFIX}.{GCODE_EXTENSION}")
}

/// Profiles uploaded for a single slice run follow this naming scheme and are
/// deleted after use.
pub fn is_temporary_profile(file_name: &str) -> bool {
    file_name.starts_with(TEMP_PROFILE_PREFIX) && file_name.ends_with(TEMP_PROFILE_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("demo.stl").as_deref(), Some("demo.stl"));
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("C:\\models\\my part.stl").as_deref(), Some("my_part.stl"));
        assert_eq!(sanitize_filename(".hidden.stl").as_deref(), Some("hidden.stl"));
        assert_eq!(sanitize_filename("bäcker (v2).3mf").as_deref(), Some("bcker_v2.3mf"));
        assert_eq!(sanitize_filename("../"), None);
        assert_eq!(sanitize_filename(""), None);
    }

    #[test]
    fn test_allowed_file() {
        let allowed = vec!["stl".to_string(), "3mf".to_string(), "obj".to_string()];
        assert!(allowed_file("demo.stl", &allowed));
        assert!(allowed_file("DEMO.STL", &allowed));
        assert!(allowed_file("part.v2.obj", &allowed));
        assert!(!allowed_file("demo.gcode", &allowed));
        assert!(!allowed_file("stl", &allowed));
        assert!(!allowed_file(".stl", &allowed));
    }

    #[test]
    fn test_tweaked_name() {
        assert_eq!(tweaked_name("demo.stl", false), "demo_tweaked.stl");
        assert_eq!(tweaked_name("demo.stl.stl", false), "demo.stl_tweaked.stl");
        assert_eq!(tweaked_name("model.tmp.1234.stl", true), "model_tweaked.stl");
        assert_eq!(tweaked_name("model.stl", true), "model_tweaked.stl");
    }

    #[test]
    fn test_sliced_name() {
        assert_eq!(sliced_name("demo.stl", None), "demo_withPPS.gcode");
        assert_eq!(sliced_name("demo_tweaked.stl", None), "demo_tweaked_withPPS.gcode");
        assert_eq!(sliced_name("demo.stl", Some("out.gcode")), "out.gcode");
        assert_eq!(sliced_name("demo.stl", Some("  ")), "demo_withPPS.gcode");
    }

    #[test]
    fn test_temporary_profile() {
        assert!(is_temporary_profile("slicing-profile-temp-abc.profile"));
        assert!(!is_temporary_profile("profile_015mm_none.ini"));
        assert!(!is_temporary_profile("slicing-profile-temp.ini"));
    }
}
