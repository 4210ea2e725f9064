use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{subordinate_base} is the caller's own id {caller}, cannot be its own hole"))]
    IdmapHoleCollision { caller: u32, subordinate_base: u32 },

    #[snafu(display("failed to create directory {}", path.display()))]
    DirectoryCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to create symlink {} -> {}", link.display(), target.display()))]
    SymlinkCreate {
        link: PathBuf,
        target: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to write {}", path.display()))]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to read {}", path.display()))]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to download {url}"))]
    Download {
        url: String,
        source: reqwest::Error,
    },

    #[snafu(display("rootfs digest mismatch for {arch}: expected {expected}, got {actual}"))]
    DigestMismatch {
        arch: String,
        expected: String,
        actual: String,
    },

    #[snafu(display("failed to extract rootfs into {}", path.display()))]
    Extract {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("no rootfs configured for arch {arch}"))]
    NoRootfs { arch: String },

    #[snafu(display("container {} is owned by uid {owner}, not caller uid {caller}", cdir.display()))]
    NotOwned {
        cdir: PathBuf,
        owner: u32,
        caller: u32,
    },

    #[snafu(display("unknown setarch variant {variant}"))]
    UnknownSetarch { variant: String },

    #[snafu(display("failed to spawn the sandbox launcher"))]
    JailerSpawn { source: std::io::Error },

    #[snafu(display("failed to wait for the sandbox launcher"))]
    JailerWait { source: std::io::Error },

    #[snafu(display("failed to run {helper} for pid {pid}"))]
    IdmapHelper {
        helper: &'static str,
        pid: u32,
        source: std::io::Error,
    },

    #[snafu(display("{helper} exited with status {status}"))]
    IdmapHelperFailed {
        helper: &'static str,
        status: std::process::ExitStatus,
    },

    #[snafu(display("failed to create a synchronization pipe"))]
    Pipe { source: nix::Error },

    #[snafu(display("jailer reported a malformed pid {pid:?}"))]
    JailerPid { pid: String },

    #[snafu(display("idmap handshake with the sandbox launcher failed"))]
    Handshake { source: std::io::Error },

    #[snafu(display("bootstrap script exited with status {status}"))]
    BootstrapFailed { status: i32 },

    #[snafu(display("refresh script exited with status {status}"))]
    RefreshFailed { status: i32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
