//! Per-recipe task execution: path resolution, environment setup, the
//! `options=...net...` opt-in scan, and exit-code classification (spec
//! §4.5).

use af_config::ProjectConfig;
use af_container::{Container, RunOptions, MOUNTS};
use lazy_static::lazy_static;
use regex::Regex;
use snafu::{ResultExt, Snafu};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read APKBUILD for {startdir}"))]
    ReadApkbuild { startdir: String, source: std::io::Error },

    #[snafu(display("failed to prepare build directory for {startdir}"))]
    PrepareBuildDir { startdir: String, source: std::io::Error },

    #[snafu(display("failed to run the build script for {startdir}"))]
    Run { startdir: String, source: af_container::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

lazy_static! {
    /// `^options=(["']?)[^"']*\bnet\b[^"']*\1` from spec §4.5.
    static ref NET_OPTION: Regex =
        Regex::new(r#"^options=(["']?)[^"']*\bnet\b[^"']*\1"#).unwrap();
}

/// Exit-code classification of one task's build script run. `Success`
/// covers both retcode 0 and the alternate-success retcode 10; anything
/// else is `Failure` (classified further into FAIL/ERROR by the caller per
/// spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(i32),
}

const ALT_SUCCESS: i32 = 10;

impl Outcome {
    fn from_retcode(rc: i32) -> Self {
        if rc == 0 || rc == ALT_SUCCESS {
            Outcome::Success
        } else {
            Outcome::Failure(rc)
        }
    }
}

/// Recreates `<buildbase>/tmp`, returning the environment a build task
/// should run with and the real on-disk path of that tmp directory.
fn run_env(container: &Container, startdir: &str) -> Result<(BTreeMap<String, String>, PathBuf)> {
    let buildbase = PathBuf::from(MOUNTS[1]).join(startdir); // "builddir"
    let tmp_real = container
        .cdir()
        .join("af/config/builddir")
        .join(startdir)
        .join("tmp");

    if let Some(parent) = tmp_real.parent() {
        let _ = std::fs::remove_dir_all(parent);
    }
    std::fs::create_dir_all(&tmp_real).context(PrepareBuildDirSnafu { startdir })?;

    let tmp = buildbase.join("tmp").to_string_lossy().into_owned();
    let mut env = BTreeMap::new();
    for key in ["HOME", "TEMP", "TEMPDIR", "TMP", "TMPDIR"] {
        env.insert(key.to_string(), tmp.clone());
    }
    env.insert("ABUILD_TMP".to_string(), buildbase.to_string_lossy().into_owned());
    // "deps" is skipped: world is refreshed before the next package anyway.
    env.insert("CLEANUP".to_string(), "srcdir pkgdir".to_string());
    env.insert("ERROR_CLEANUP".to_string(), String::new());

    Ok((env, tmp_real))
}

/// Scans the recipe's APKBUILD for the `net` build option, per spec §4.5
/// step 4. Logs a warning when it grants networking.
fn wants_networking(container: &Container, startdir: &str) -> Result<bool> {
    let apkbuild = container
        .cdir()
        .join("af/config/aportsdir")
        .join(startdir)
        .join("APKBUILD");
    let contents = std::fs::read_to_string(&apkbuild).context(ReadApkbuildSnafu { startdir })?;

    let net = contents.lines().any(|line| NET_OPTION.is_match(line));
    if net {
        log::warn!("{startdir}: network access enabled");
    }
    Ok(net)
}

/// Runs `build_script startdir` inside `container`'s sandbox, applying the
/// per-task environment, repo extraction, and networking policy from spec
/// §4.5. Cleans up the task's tmp directory on success.
pub fn run_task(
    container: &mut Container,
    project: &ProjectConfig,
    startdir: &str,
    build_script: &str,
) -> Result<Outcome> {
    let (env, tmp) = run_env(container, startdir)?;

    let repo = startdir.split('/').next().unwrap_or(startdir);
    container.set_repo(repo);

    let net_opt_in = wants_networking(container, startdir)?;
    let net = net_opt_in || project.build.networking.iter().any(|a| a == repo || a == startdir);

    let mut opts = RunOptions::unprivileged();
    opts.network = net;
    opts.extra_env = env;

    let argv = vec![build_script.to_string(), startdir.to_string()];
    let rc = container.run(&argv, opts).context(RunSnafu { startdir })?;

    let outcome = Outcome::from_retcode(rc);
    if outcome == Outcome::Success {
        log::info!("{startdir}: removing package tmpfiles");
        let _ = std::fs::remove_dir_all(&tmp);
    }

    Ok(outcome)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn net_option_regex_matches_quoted_and_bare_forms() {
        assert!(NET_OPTION.is_match(r#"options="!check net""#));
        assert!(NET_OPTION.is_match("options=net"));
        assert!(!NET_OPTION.is_match("options=\"!check\""));
    }

    #[test]
    fn retcode_zero_and_ten_are_both_success() {
        assert_eq!(Outcome::from_retcode(0), Outcome::Success);
        assert_eq!(Outcome::from_retcode(10), Outcome::Success);
        assert_eq!(Outcome::from_retcode(1), Outcome::Failure(1));
    }
}
