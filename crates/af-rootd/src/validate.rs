//! Per-command argument validators. A strict whitelist: each caller-visible
//! command name has exactly one parser, and any flag the parser doesn't
//! recognize is rejected rather than passed through. Mirrors the source's
//! `root.py` `_ParseOrRaise` subparsers one-for-one.

use clap::{Args, Parser, Subcommand};

/// Maps a whitelisted caller-visible command to the server-side binary it
/// re-execs as, once its arguments have validated.
pub fn server_command(cmd: &str) -> &'static str {
    match cmd {
        "abuild-fetch" => "abuild-fetch",
        "abuild-addgroup" => "addgroup",
        "abuild-adduser" => "adduser",
        "abuild-apk" => "apk",
        "apk" => "apk",
        _ => unreachable!("caller checks the whitelist before calling server_command"),
    }
}

pub fn validate(cmd: &str, argv: &[String]) -> Result<(), String> {
    match cmd {
        "abuild-fetch" => AbuildFetch::try_parse_from(argv).map(|_| ()).map_err(|e| e.to_string()),
        "abuild-addgroup" => AbuildAddgroup::try_parse_from(argv).map(|_| ()).map_err(|e| e.to_string()),
        "abuild-adduser" => AbuildAdduser::try_parse_from(argv).map(|_| ()).map_err(|e| e.to_string()),
        "abuild-apk" => validate_abuild_apk(argv),
        "apk" => ApkFetch::try_parse_from(argv).map(|_| ()).map_err(|e| e.to_string()),
        other => Err(format!("command not allowed: {other}")),
    }
}

#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_flag = true, disable_help_subcommand = true)]
struct AbuildFetch {
    #[arg(short = 'd')]
    dir: Option<String>,
    url: String,
}

#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_flag = true, disable_help_subcommand = true)]
struct AbuildAddgroup {
    #[arg(short = 'S', required = true)]
    system: bool,
    group: String,
}

#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_flag = true, disable_help_subcommand = true)]
struct AbuildAdduser {
    #[arg(short = 'D', required = true)]
    disabled_password: bool,
    #[arg(short = 'G')]
    group: Option<String>,
    #[arg(short = 'H', required = true)]
    no_home: bool,
    #[arg(short = 'S', required = true)]
    system: bool,
    user: String,
}

/// The bare `apk` command's own validator: fetch-only, per the table in
/// spec §4.2 ("fetch-only subparser").
#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_flag = true, disable_help_subcommand = true)]
struct ApkFetch {
    #[arg(short = 'q', long)]
    quiet: bool,
    #[arg(long)]
    repositories_file: Option<String>,
    #[arg(short = 's', long)]
    simulate: bool,
    #[arg(long)]
    stdout: bool,
    #[command(subcommand)]
    applet: Option<ApkFetchApplet>,
}

#[derive(Debug, Subcommand)]
enum ApkFetchApplet {
    Fetch(ApkFetchFetch),
}

#[derive(Debug, Args)]
struct ApkFetchFetch {
    #[arg(long)]
    stdout: bool,
    #[arg(short = 'q', long)]
    quiet: bool,
    #[arg(long)]
    repositories_file: Option<String>,
    #[arg(short = 's', long)]
    simulate: bool,
    #[arg(required = true)]
    packages: Vec<String>,
}

/// The `abuild-apk` command's validator: the full `apk` applet surface,
/// with the additional `--virtual .makedepends-*` / `.makedepends-*`-only
/// rules applied after parsing (spec §4.2).
#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_flag = true, disable_help_subcommand = true)]
struct AbuildApk {
    #[arg(long)]
    print_arch: bool,
    #[arg(short = 'q', long)]
    quiet: bool,
    #[arg(short = 'X', long)]
    repository: Option<String>,
    #[arg(short = 's', long)]
    simulate: bool,
    #[arg(long)]
    wait: Option<i64>,
    #[command(subcommand)]
    applet: Option<AbuildApkApplet>,
}

#[derive(Debug, Subcommand)]
enum AbuildApkApplet {
    Add(ApkAdd),
    Del(ApkDel),
    Fix(ApkFix),
    Update,
    Upgrade(ApkUpgrade),
}

#[derive(Debug, Args)]
struct ApkAdd {
    #[arg(short = 't', long = "virtual", required = true)]
    virtual_name: String,
    #[arg(short = 'l', long)]
    latest: bool,
    #[arg(short = 'u', long)]
    upgrade: bool,
    #[arg(short = 'q', long)]
    quiet: bool,
    #[arg(short = 'X', long)]
    repository: Option<String>,
    #[arg(short = 's', long)]
    simulate: bool,
    #[arg(long)]
    wait: Option<i64>,
    packages: Vec<String>,
}

#[derive(Debug, Args)]
struct ApkDel {
    #[arg(required = true)]
    packages: Vec<String>,
    #[arg(short = 'q', long)]
    quiet: bool,
    #[arg(short = 'X', long)]
    repository: Option<String>,
    #[arg(short = 's', long)]
    simulate: bool,
    #[arg(long)]
    wait: Option<i64>,
}

#[derive(Debug, Args)]
struct ApkFix {
    #[arg(short = 'd', long)]
    depends: bool,
    #[arg(short = 'r', long)]
    reinstall: bool,
    #[arg(short = 'x', long)]
    xattr: bool,
    #[arg(long)]
    directory_permissions: bool,
    #[arg(short = 'u', long)]
    upgrade: bool,
    packages: Vec<String>,
    #[arg(short = 'q', long)]
    quiet: bool,
    #[arg(short = 'X', long)]
    repository: Option<String>,
    #[arg(short = 's', long)]
    simulate: bool,
    #[arg(long)]
    wait: Option<i64>,
}

#[derive(Debug, Args)]
struct ApkUpgrade {
    #[arg(short = 'a', long)]
    available: bool,
    #[arg(short = 'l', long)]
    latest: bool,
    #[arg(short = 'q', long)]
    quiet: bool,
    #[arg(short = 'X', long)]
    repository: Option<String>,
    #[arg(short = 's', long)]
    simulate: bool,
    #[arg(long)]
    wait: Option<i64>,
}

const MAKEDEPENDS_PREFIX: &str = ".makedepends-";

fn validate_abuild_apk(argv: &[String]) -> Result<(), String> {
    let opts = AbuildApk::try_parse_from(argv).map_err(|e| e.to_string())?;

    match &opts.applet {
        Some(AbuildApkApplet::Add(add)) if !add.virtual_name.starts_with(MAKEDEPENDS_PREFIX) => {
            Err(format!("invalid virtual name: {}", add.virtual_name))
        }
        Some(AbuildApkApplet::Del(del))
            if del.packages.iter().any(|p| !p.starts_with(MAKEDEPENDS_PREFIX)) =>
        {
            Err("can only remove makedepends virtual packages".to_string())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn argv(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn rejects_virtual_name_without_makedepends_prefix() {
        let err = validate("abuild-apk", &argv("add --virtual foo bar")).unwrap_err();
        assert!(err.contains("invalid virtual name"));
    }

    #[test]
    fn accepts_well_formed_makedepends_add() {
        validate("abuild-apk", &argv("add --virtual .makedepends-core gcc make")).unwrap();
    }

    #[test]
    fn rejects_del_of_non_makedepends_package() {
        let err = validate("abuild-apk", &argv("del somepkg")).unwrap_err();
        assert!(err.contains("makedepends"));
    }

    #[test]
    fn rejects_unknown_flag() {
        assert!(validate("abuild-fetch", &argv("--bogus -d /tmp http://example.invalid/x")).is_err());
    }

    #[test]
    fn apk_top_level_only_accepts_fetch() {
        validate("apk", &argv("fetch --stdout somepkg")).unwrap();
    }
}
