// Purpose: Stamp the kpm binary with the commit it was built from.
// Inputs/Outputs: Reads KPM_GIT_COMMIT or asks git; emits rustc-env KPM_GIT_COMMIT.
// Invariants: Never fails the build; a missing git checkout just leaves the stamp unset.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=KPM_GIT_COMMIT");

    if let Ok(v) = env::var("KPM_GIT_COMMIT") {
        let v = v.trim();
        if !v.is_empty() {
            println!("cargo:rustc-env=KPM_GIT_COMMIT={v}");
            return;
        }
    }

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let Some(mut stamp) = git_output(&["rev-parse", "--short=12", "HEAD"]) else {
        return;
    };
    if worktree_dirty() {
        stamp.push_str("-dirty");
    }
    println!("cargo:rustc-env=KPM_GIT_COMMIT={stamp}");
}

fn git_output(args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if s.is_empty() { None } else { Some(s) }
}

fn worktree_dirty() -> bool {
    [
        &["diff", "--no-ext-diff", "--quiet", "--exit-code"][..],
        &["diff", "--cached", "--no-ext-diff", "--quiet", "--exit-code"][..],
    ]
    .iter()
    .any(|args| {
        Command::new("git")
            .args(*args)
            .status()
            .map(|s| !s.success())
            .unwrap_or(false)
    })
}
