//! Shared harness for CLI tests: a private project directory and store.

#![allow(dead_code)]

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

pub struct TestHarness {
    root: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("tempdir"),
        }
    }

    /// `jobmesh` with the store and storage roots inside the harness and no
    /// user-level configuration leaking in.
    pub fn cmd(&self, args: &[&str]) -> Command {
        let root = self.root.path();
        let mut cmd = Command::cargo_bin("jobmesh").expect("binary built");
        cmd.current_dir(root)
            .env("HOME", root)
            .env("XDG_CONFIG_HOME", root.join("xdg"))
            .env(
                "JOBMESH_STORE_URL",
                format!("sqlite://{}", root.join("store.db").display()),
            )
            .env("JOBMESH_WORKSPACE_DIR", root.join("workspace"))
            .env("JOBMESH_FILESTORAGE_DIR", root.join("storage"))
            .env_remove("JOBMESH_DEVELOP")
            .env_remove("JOBMESH_LOG")
            .args(args);
        cmd
    }

    /// Run a command expected to succeed with `--json` and return `data`.
    pub fn json(&self, args: &[&str]) -> Value {
        let mut full = args.to_vec();
        full.push("--json");
        let output = self.cmd(&full).assert().success().get_output().stdout.clone();
        let parsed: Value = serde_json::from_slice(&output).expect("valid JSON");
        parsed["data"].clone()
    }

    pub fn path(&self) -> &std::path::Path {
        self.root.path()
    }
}
