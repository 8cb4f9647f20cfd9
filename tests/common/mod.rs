//! Shared fixtures: a scratch workspace with fake tweak and slice tools.
#![allow(dead_code)]

use async_trait::async_trait;
use preprint_service::config::Config;
use preprint_service::relay::{ArtifactRelay, RelayError, RelayMetadata, RelayTarget};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use tempfile::TempDir;

/// Copies `-i` to `-o` and records its arguments next to itself.
pub const TWEAKER_OK: &str = r#"#!/bin/sh
echo "$@" > "$(dirname "$0")/tweaker.args"
while [ $# -gt 0 ]; do
  case "$1" in
    -i) in="$2"; shift 2 ;;
    -o) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
cp "$in" "$out"
"#;

/// Writes a small g-code file with summary comments to `--output`.
pub const SLICER_OK: &str = r#"#!/bin/sh
echo "$@" > "$(dirname "$0")/slicer.args"
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
printf '; generated by fake slicer\nG28\nG1 X10 Y10 E1\n; filament used = 1234.5mm (2.97cm3)\n; estimated printing time (normal mode) = 1h 2m 3s\n' > "$out"
echo "Slicing finished"
"#;

pub struct Workspace {
    pub dir: TempDir,
    pub config: Config,
}

impl Workspace {
    pub fn new() -> Self {
        Self::with_tools(TWEAKER_OK, SLICER_OK)
    }

    pub fn with_tools(tweaker: &str, slicer: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path().join("tools");
        fs::create_dir_all(&tools).unwrap();
        let tweaker_path = tools.join("tweaker.sh");
        let slicer_path = tools.join("slicer.sh");
        write_script(&tweaker_path, tweaker);
        write_script(&slicer_path, slicer);

        let mut config = Config::default();
        config.paths.uploads_dir = dir.path().join("uploads");
        config.paths.profiles_dir = dir.path().join("profiles");
        config.paths.default_profile = "default.ini".to_string();
        config.tools.tweaker = vec!["sh".to_string(), tweaker_path.display().to_string()];
        config.tools.slicer_candidates = vec![slicer_path];
        config.runner.poll_interval_ms = 20;
        config.runner.terminate_grace_ms = 500;
        fs::create_dir_all(&config.paths.uploads_dir).unwrap();
        fs::create_dir_all(&config.paths.profiles_dir).unwrap();
        Self { dir, config }
    }

    pub fn uploads(&self) -> &Path {
        &self.config.paths.uploads_dir
    }

    pub fn add_model(&self, name: &str) -> PathBuf {
        let path = self.uploads().join(name);
        fs::write(&path, b"solid demo\nendsolid demo\n").unwrap();
        path
    }

    pub fn add_profile(&self, name: &str) -> PathBuf {
        let path = self.config.paths.profiles_dir.join(name);
        fs::write(&path, b"layer_height = 0.15\n").unwrap();
        path
    }

    /// Arguments of the last call of a fake tool, `None` if it never ran.
    pub fn tool_args(&self, tool: &str) -> Option<String> {
        fs::read_to_string(self.dir.path().join("tools").join(format!("{tool}.args"))).ok()
    }
}

/// Installed by a child process: a writable descriptor open in this process
/// while another test forks can make exec fail with ETXTBSY.
pub fn write_script(path: &Path, body: &str) {
    let source = path.with_extension("src");
    fs::write(&source, body).unwrap();
    let status = Command::new("install")
        .arg("-m")
        .arg("755")
        .arg(&source)
        .arg(path)
        .status()
        .unwrap();
    assert!(status.success(), "failed to install {}", path.display());
}

/// Relay double that records uploads instead of sending them.
#[derive(Default)]
pub struct RecordingRelay {
    pub reject_with: Option<u16>,
    pub uploads: Mutex<Vec<(String, String)>>,
}

impl RecordingRelay {
    pub fn rejecting(status: u16) -> Self {
        Self {
            reject_with: Some(status),
            ..Self::default()
        }
    }

    /// Names of the uploaded artifacts in upload order.
    pub fn uploaded_names(&self) -> Vec<String> {
        self.uploads.lock().unwrap().iter().map(|(_, name)| name.clone()).collect()
    }
}

#[async_trait]
impl ArtifactRelay for RecordingRelay {
    async fn upload(&self, target: &RelayTarget, artifact: &Path, metadata: &RelayMetadata) -> Result<u16, RelayError> {
        assert!(artifact.is_file(), "relayed artifact must exist");
        self.uploads
            .lock()
            .unwrap()
            .push((target.url.clone(), metadata.artifact_name.clone()));
        match self.reject_with {
            Some(status) => Err(RelayError::Rejected {
                url: target.upload_url(),
                status,
            }),
            None => Ok(201),
        }
    }

    async fn check_connection(&self, _url: &str) -> bool {
        true
    }
}
