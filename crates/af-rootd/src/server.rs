//! The root daemon server loop: per spec §4.2, accepts requests on a
//! connected socket inherited by the sandboxed child, validates the
//! requested command against the whitelist in [`crate::validate`], and for
//! accepted requests re-enters the *same* container with root, networking,
//! and a writable root.

use crate::error::{self, Result};
use crate::validate;
use crate::wire;
use af_config::ProjectConfig;
use af_container::{Container, RunOptions};
use log::{debug, error as log_err};
use nix::unistd::close;
use snafu::ResultExt;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

/// The strict command whitelist from spec §4.2's table.
const ALLOWED: &[&str] = &["apk", "abuild-apk", "abuild-fetch", "abuild-addgroup", "abuild-adduser"];

/// Serves root daemon requests on `listener` until it closes. One thread per
/// open container, spawned lazily the first time a container is opened
/// (spec §5).
pub fn serve(listener: UnixListener, container: &Container, project: &ProjectConfig) -> Result<()> {
    for stream in listener.incoming() {
        let stream = stream.context(error::AcceptSnafu)?;
        handle_connection(stream, container, project);
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, container: &Container, project: &ProjectConfig) {
    let fd = stream.as_raw_fd();
    let mut announced = false;

    loop {
        let mut fds: [RawFd; 3] = [-1, -1, -1];

        let (argv, received) = match wire::recv_fds(fd) {
            Ok(v) => v,
            Err(_) => {
                debug!("disconnected");
                break;
            }
        };
        if argv.is_empty() {
            debug!("disconnected");
            break;
        }
        if !announced {
            debug!("connected");
            announced = true;
        }

        if received.len() != wire::NUM_FDS {
            err_reply(&mut stream, &mut fds, "no file descriptors given");
            continue;
        }
        fds = [received[0], received[1], received[2]];

        let argv = String::from_utf8_lossy(&argv).into_owned();
        let mut parts: Vec<String> = argv.split('\0').map(str::to_string).collect();
        let cmd = parts[0].clone();

        if !ALLOWED.contains(&cmd.as_str()) {
            err_reply(&mut stream, &mut fds, &format!("command not allowed: {cmd}"));
            continue;
        }

        debug!("received command: {}", parts.join(" "));

        if let Err(message) = validate::validate(&cmd, &parts[1..]) {
            err_reply(&mut stream, &mut fds, &message);
            continue;
        }
        parts[0] = validate::server_command(&cmd).to_string();

        let rc = run_in_container(container, project, &parts, fds);
        if wire::send_retcode(&mut stream, rc).is_err() {
            close_fds(&mut fds);
            break;
        }
        close_fds(&mut fds);
    }

    close_fds(&mut [fd, -1, -1]);
}

/// Re-enters the container for one accepted request. Per spec §4.2, the
/// server refreshes skeleton files before every re-entry, not just once per
/// container lifetime, since a project's `skel*` trees can change between
/// requests (e.g. a build installing new packages the skeleton should now
/// ship).
fn run_in_container(container: &Container, project: &ProjectConfig, argv: &[String], fds: [RawFd; 3]) -> i32 {
    if let Err(e) = af_container::cont_refresh_skeleton(container, project) {
        log_err!("root daemon: skeleton refresh failed: {e}");
        return 1;
    }

    let opts = RunOptions::privileged().with_stdio(fds);
    match container.run(argv, opts) {
        Ok(rc) => rc,
        Err(e) => {
            log_err!("root daemon: container run failed: {e}");
            1
        }
    }
}

fn err_reply(stream: &mut UnixStream, fds: &mut [RawFd; 3], message: &str) {
    use std::io::Write;
    if fds[2] >= 0 {
        let mut stderr = unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(fds[2]) };
        let _ = writeln!(stderr, "{message}");
        std::mem::forget(stderr);
    }
    let _ = wire::send_retcode(stream, 1);
    log_err!("{message}");
    close_fds(fds);
}

fn close_fds(fds: &mut [RawFd; 3]) {
    for fd in fds.iter_mut() {
        if *fd >= 0 {
            let _ = close(*fd);
            *fd = -1;
        }
    }
}
