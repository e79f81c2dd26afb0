//! Fetch the kard sources from a git repository at creation time

use std::path::Path;
use std::process::Command;

use super::{Plugin, SetupContext};
use crate::error::{DriverError, Result};

const DEFAULT_BRANCH: &str = "master";

pub struct Git;

impl Plugin for Git {
    fn name(&self) -> &'static str {
        "git"
    }

    fn description(&self) -> &'static str {
        "clone git_repo (git_branch) into src_path when it does not exist"
    }

    fn setup(&self, ctx: &SetupContext<'_>) -> Result<()> {
        let setting = |key: &str| {
            ctx.extra
                .get_str(key)
                .or_else(|| ctx.meta.get_str(key))
                .map(str::to_string)
        };

        let Some(repo) = setting("git_repo") else {
            return Ok(());
        };
        let src_path = setting("src_path")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| ctx.kard_path.join("src"));
        if src_path.is_dir() {
            tracing::info!(path = %src_path.display(), "using existing sources");
            return Ok(());
        }

        let branch = setting("git_branch").unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        tracing::info!(repo = %repo, branch = %branch, path = %src_path.display(), "fetching sources");
        let dest = src_path.to_string_lossy().into_owned();
        git(
            None,
            &[
                "clone",
                "--single-branch",
                "--depth",
                "1",
                "-b",
                &branch,
                &repo,
                &dest,
            ],
        )?;
        git(
            Some(&src_path),
            &["submodule", "update", "--init", "--recursive"],
        )
    }
}

fn git(dir: Option<&Path>, args: &[&str]) -> Result<()> {
    let mut command = Command::new("git");
    if let Some(dir) = dir {
        command.arg("-C").arg(dir);
    }
    command.args(args);

    let output = command.output().map_err(|e| DriverError::Collaborator {
        tool: "git".to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        status: "not started".to_string(),
        stderr: e.to_string(),
    })?;
    if output.status.success() {
        return Ok(());
    }
    Err(DriverError::Collaborator {
        tool: "git".to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkr_core::{Environment, Meta, PkrRoot};
    use serde_json::json;

    fn run(meta: serde_json::Value, extra: serde_json::Value) -> Result<()> {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("env/dev")).unwrap();
        std::fs::write(dir.path().join("env/dev/env.yml"), "containers: {}\n").unwrap();
        std::fs::create_dir_all(dir.path().join("kard/demo/src")).unwrap();
        let env = Environment::load(&PkrRoot::at(dir.path()), "dev").unwrap();
        let kard_path = dir.path().join("kard/demo");

        let meta = Meta::from(meta);
        let extra = Meta::from(extra);
        Git.setup(&SetupContext {
            kard_name: "demo",
            kard_path: &kard_path,
            env: &env,
            meta: &meta,
            extra: &extra,
        })
    }

    #[test]
    fn test_without_repository_does_nothing() {
        run(json!({}), json!({})).unwrap();
    }

    #[test]
    fn test_existing_sources_are_kept() {
        run(json!({"git_repo": "/nonexistent/repo.git"}), json!({})).unwrap();
    }

    #[test]
    fn test_clone_failure_is_reported() {
        let err = run(
            json!({"git_repo": "/nonexistent/repo.git"}),
            json!({"src_path": "/nonexistent/pkr-src"}),
        )
        .unwrap_err();
        match err {
            DriverError::Collaborator { tool, args, .. } => {
                assert_eq!(tool, "git");
                assert_eq!(args[0], "clone");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
