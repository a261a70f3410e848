// Purpose: Git transport for git-backed dependency sources.
// Inputs/Outputs: `GitSource` + destination; leaves a working tree checked out at the requested ref.
// Invariants: A commit ref is verified with `rev-parse` after checkout.
// Gotchas: Insecure TLS is per-invocation (`-c http.sslVerify=false`), never written to git config.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, bail};

use crate::pkg::fetch::FetchOptions;
use crate::pkg::source::{GitRef, GitSource};

fn run_git(args: &[String], cwd: Option<&Path>) -> anyhow::Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(c) = cwd {
        cmd.current_dir(c);
    }
    // Never block on a credential prompt.
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    let out = cmd.output().context("failed to execute git")?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        bail!("git {:?} failed: {}", args, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn global_args(opts: &FetchOptions) -> Vec<String> {
    if opts.insecure_skip_tls_verify {
        vec!["-c".into(), "http.sslVerify=false".into()]
    } else {
        Vec::new()
    }
}

/// Arguments for the initial `git clone` of `src` into `dest`.
pub fn clone_args(src: &GitSource, dest: &Path, opts: &FetchOptions) -> Vec<String> {
    let mut args = global_args(opts);
    args.push("clone".into());
    match &src.reference {
        GitRef::Tag(r) | GitRef::Branch(r) => {
            args.extend(["--depth".into(), "1".into(), "--branch".into(), r.clone()]);
        }
        GitRef::Default => {
            args.extend(["--depth".into(), "1".into()]);
        }
        // Arbitrary commits need full history to be reachable.
        GitRef::Commit(_) => {}
    }
    args.push("--".into());
    args.push(src.url.clone());
    args.push(dest.to_string_lossy().to_string());
    args
}

fn reject_option_like(src: &GitSource) -> anyhow::Result<()> {
    let reference = match &src.reference {
        GitRef::Tag(r) | GitRef::Branch(r) | GitRef::Commit(r) => Some(r.as_str()),
        GitRef::Default => None,
    };
    if src.url.starts_with('-') || reference.is_some_and(|r| r.starts_with('-')) {
        bail!("refusing git url or reference that starts with `-`: {}", src.url);
    }
    Ok(())
}

pub fn fetch_git(src: &GitSource, dest: &Path, opts: &FetchOptions) -> anyhow::Result<()> {
    reject_option_like(src)?;
    // `git clone` wants to create the directory itself.
    if dest.exists() {
        std::fs::remove_dir_all(dest).with_context(|| format!("clear {}", dest.display()))?;
    }
    run_git(&clone_args(src, dest, opts), None)
        .with_context(|| format!("clone {}", src.url))?;

    if let GitRef::Commit(commit) = &src.reference {
        let mut checkout = global_args(opts);
        checkout.extend(["checkout".into(), "--force".into(), commit.clone()]);
        run_git(&checkout, Some(dest)).with_context(|| format!("checkout {commit}"))?;

        let head = run_git(&["rev-parse".into(), "HEAD".into()], Some(dest))?;
        if !head.starts_with(commit.as_str()) {
            bail!("checked out {head}, expected commit {commit}");
        }
    }
    tracing::debug!(url = %src.url, dest = %dest.display(), "git fetch complete");
    Ok(())
}
