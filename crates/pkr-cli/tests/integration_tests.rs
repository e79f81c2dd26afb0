//! Integration tests for CLI commands

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Get the fixtures path
fn fixtures_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

/// Copy the demo tree into a fresh directory
fn demo_tree() -> TempDir {
    let source = fixtures_path().join("demo-tree");
    let dir = TempDir::new().unwrap();
    for entry in walkdir::WalkDir::new(&source) {
        let entry = entry.unwrap();
        let dest = dir.path().join(entry.path().strip_prefix(&source).unwrap());
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest).unwrap();
        } else {
            std::fs::copy(entry.path(), &dest).unwrap();
        }
    }
    dir
}

/// Helper to run pkr inside `dir`
fn pkr(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pkr"))
        .args(args)
        .current_dir(dir)
        .env_remove("PKR_PATH")
        .env_remove("PKR_KARD")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute pkr")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "pkr failed with {:?}\nstdout: {}\nstderr: {}",
        output.status.code(),
        stdout(output),
        stderr(output)
    );
}

mod init_command {
    use super::*;

    #[test]
    fn test_init_creates_tree() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("project");
        let output = pkr(dir.path(), &["init", target.to_str().unwrap()]);

        assert_success(&output);
        assert!(stdout(&output).contains("File structure created in:"));
        assert!(target.join("env/dev/env.yml").is_file());
        assert!(target.join("kard").is_dir());

        let output = pkr(&target, &["kard", "list"]);
        assert_success(&output);
        assert!(stdout(&output).contains("No kard found."));
    }

    #[test]
    fn test_outside_a_tree_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let output = pkr(dir.path(), &["kard", "list"]);

        assert_eq!(output.status.code(), Some(2));
        let err = stderr(&output);
        assert!(err.contains("error[config]:"), "{err}");
        assert!(err.contains("pkr init"), "{err}");
    }
}

mod kard_command {
    use super::*;

    #[test]
    fn test_create_selects_the_kard() {
        let dir = demo_tree();
        let output = pkr(dir.path(), &["kard", "create", "demo", "--extra", "tag=2.0"]);

        assert_success(&output);
        assert!(stdout(&output).contains("Current kard is now: demo"));
        assert!(dir.path().join("kard/demo").is_dir());

        let output = pkr(dir.path(), &["kard", "get"]);
        assert_success(&output);
        assert!(stdout(&output).contains("Current kard: demo"));

        let output = pkr(dir.path(), &["kard", "list"]);
        assert_success(&output);
        let listed = stdout(&output);
        assert!(listed.contains("Kards:"));
        assert!(listed.contains(" - demo"));
    }

    #[test]
    fn test_pkr_path_from_elsewhere() {
        let dir = demo_tree();
        let elsewhere = TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();

        let output = pkr(
            elsewhere.path(),
            &["--pkr-path", root, "kard", "create", "demo"],
        );
        assert_success(&output);
        assert!(dir.path().join("kard/demo").is_dir());
    }

    #[test]
    fn test_dump_full_and_cleaned() {
        let dir = demo_tree();
        assert_success(&pkr(
            dir.path(),
            &["kard", "create", "demo", "--extra", "tag=2.0", "owner=ops"],
        ));

        let output = pkr(dir.path(), &["kard", "dump"]);
        assert_success(&output);
        let full: serde_yaml::Value = serde_yaml::from_str(&stdout(&output)).unwrap();
        assert_eq!(full["tag"].as_str(), Some("2.0"));
        assert_eq!(full["api"]["get_url"].as_str(), Some("https://api.example.org"));

        let output = pkr(dir.path(), &["kard", "dump", "--cleaned"]);
        assert_success(&output);
        let cleaned: serde_yaml::Value = serde_yaml::from_str(&stdout(&output)).unwrap();
        assert_eq!(cleaned["tag"].as_str(), Some("2.0"));
        assert_eq!(cleaned["owner"].as_str(), Some("ops"));
        assert!(cleaned.get("api").is_none());
    }

    #[test]
    fn test_missing_meta_lists_keys() {
        let dir = demo_tree();
        let output = pkr(dir.path(), &["kard", "create", "demo", "-e", "bare"]);

        assert_eq!(output.status.code(), Some(2));
        let err = stderr(&output);
        assert!(err.contains("error[config]:"), "{err}");
        assert!(err.contains("tag") && err.contains("owner"), "{err}");
        assert!(!dir.path().join("kard/demo").exists());
    }

    #[test]
    fn test_malformed_meta_file() {
        let dir = demo_tree();
        let meta = dir.path().join("broken.yml");
        std::fs::write(&meta, "a: [1, 2\n  b: :\n").unwrap();

        let output = pkr(
            dir.path(),
            &["kard", "create", "demo", "-m", meta.to_str().unwrap()],
        );

        assert_eq!(output.status.code(), Some(2));
        let err = stderr(&output);
        assert!(err.contains("cli-meta-file") && err.contains("rank 1"), "{err}");
        assert!(!dir.path().join("kard/demo").exists());
    }

    #[test]
    fn test_unknown_driver() {
        let dir = demo_tree();
        let output = pkr(dir.path(), &["kard", "create", "demo", "-d", "swarm"]);

        assert_eq!(output.status.code(), Some(2));
        assert!(stderr(&output).contains("swarm"));
    }

    #[test]
    fn test_unstable_meta_is_a_template_error() {
        let dir = demo_tree();
        let output = pkr(
            dir.path(),
            &["kard", "create", "demo", "--extra", "selfref={{ selfref }}"],
        );

        assert_eq!(output.status.code(), Some(3));
        assert!(stderr(&output).contains("error[template]:"));
    }

    #[test]
    fn test_no_current_kard() {
        let dir = demo_tree();
        let output = pkr(dir.path(), &["kard", "get"]);

        assert_eq!(output.status.code(), Some(2));
        assert!(stderr(&output).contains("--kard"));
    }

    #[test]
    fn test_make_twice_is_a_noop() {
        let dir = demo_tree();
        assert_success(&pkr(dir.path(), &["kard", "create", "demo"]));

        let output = pkr(dir.path(), &["kard", "make"]);
        assert_success(&output);
        let compose = std::fs::read_to_string(dir.path().join("kard/demo/docker-compose.yml")).unwrap();
        assert!(compose.contains("https://api.example.org"), "{compose}");

        let output = pkr(dir.path(), &["kard", "make"]);
        assert_success(&output);
        assert!(stdout(&output).contains("kard up to date"));
    }

    #[test]
    fn test_load_and_kard_flag() {
        let dir = demo_tree();
        assert_success(&pkr(dir.path(), &["kard", "create", "first"]));
        assert_success(&pkr(dir.path(), &["kard", "create", "second"]));

        let output = pkr(dir.path(), &["kard", "load", "first"]);
        assert_success(&output);
        assert!(stdout(&output).contains("Current kard is now: first"));

        let output = pkr(dir.path(), &["--kard", "second", "kard", "get"]);
        assert!(stdout(&output).contains("Current kard: second"));

        let output = pkr(dir.path(), &["kard", "load", "missing"]);
        assert_eq!(output.status.code(), Some(2));
    }
}

mod image_command {
    use super::*;

    #[test]
    fn test_base_driver_cannot_list_images() {
        let dir = demo_tree();
        assert_success(&pkr(dir.path(), &["kard", "create", "demo", "-d", "base"]));

        let output = pkr(dir.path(), &["image", "list"]);
        assert_eq!(output.status.code(), Some(4));
        assert!(stderr(&output).contains("error[unsupported]:"));
    }
}

mod listext_command {
    use super::*;

    #[test]
    fn test_all_features() {
        let dir = demo_tree();
        let output = pkr(dir.path(), &["listext", "-a"]);

        assert_success(&output);
        let listed = stdout(&output);
        for name in ["git", "auto_volume", "basic_template"] {
            assert!(listed.contains(name), "{name} missing from {listed}");
        }
    }

    #[test]
    fn test_kard_features() {
        let dir = demo_tree();
        assert_success(&pkr(dir.path(), &["kard", "create", "demo", "-f", "debug"]));

        let output = pkr(dir.path(), &["listext"]);
        assert_success(&output);
        assert!(stdout(&output).contains(" - debug"));
    }
}
