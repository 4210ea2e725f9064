//! Client shim run inside the sandbox. Every privileged helper invocation
//! inside a container (`ABUILD_FETCH`, `ADDGROUP`, `ADDUSER`, `SUDO_APK`,
//! `APK_FETCH`) is an env var pointing at `/af/libexec/af-sudo <name>`, so
//! the build script never calls the privileged binaries directly; this
//! binary forwards the call to the root daemon over the socket it inherited
//! (spec §4.2/§6.2) and exits with the returned retcode.

use af_rootd::wire;
use anyhow::{bail, Context, Result};
use std::env;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

const SOCKET_ENV: &str = "AF_ROOTD_SOCKET";
const DEFAULT_SOCKET: &str = "/af/config/root.sock";

fn main() -> Result<()> {
    let mut args: Vec<String> = env::args().collect();
    args.remove(0); // our own argv[0]
    if args.is_empty() {
        bail!("usage: af-sudo COMMAND ARGS...");
    }

    let socket_path = env::var(SOCKET_ENV).unwrap_or_else(|_| DEFAULT_SOCKET.to_string());
    let conn = UnixStream::connect(&socket_path)
        .with_context(|| format!("failed to connect to root daemon at {socket_path}"))?;
    let fd = conn.as_raw_fd();

    let msg = args.join("\0");
    let stdio = [
        std::io::stdin().as_raw_fd(),
        std::io::stdout().as_raw_fd(),
        std::io::stderr().as_raw_fd(),
    ];
    wire::send_fds(fd, msg.as_bytes(), &stdio).context("failed to send request to root daemon")?;

    let mut conn = conn;
    let rc = wire::recv_retcode(&mut conn).context("failed to read root daemon response")?;
    std::process::exit(rc);
}
