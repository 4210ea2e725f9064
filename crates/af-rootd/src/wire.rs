//! The root daemon wire format: a NUL-joined argv byte string plus ancillary
//! data carrying exactly three file descriptors (stdin/stdout/stderr) per
//! request, and a fixed-width little-endian retcode per response. Kept
//! byte-exact with the source's `socket.py` so `af-sudo` and the daemon
//! agree without either side needing to know the other's language.

use crate::error::{self, Result};
use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use snafu::{ensure, ResultExt};
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;

pub const NUM_FDS: usize = 3;
const BUF_SIZE: usize = 4096;

pub fn send_fds(conn: RawFd, msg: &[u8], fds: &[RawFd; NUM_FDS]) -> Result<()> {
    ensure!(
        msg.len() <= BUF_SIZE,
        error::MessageTooLargeSnafu { len: msg.len(), limit: BUF_SIZE }
    );

    let iov = [IoSlice::new(msg)];
    let cmsg = [ControlMessage::ScmRights(fds.as_slice())];
    sendmsg::<()>(conn, &iov, &cmsg, MsgFlags::empty(), None).context(error::SendSnafu)?;
    Ok(())
}

/// Returns an empty argv and no fds on a clean disconnect.
pub fn recv_fds(conn: RawFd) -> Result<(Vec<u8>, Vec<RawFd>)> {
    let mut buf = [0u8; BUF_SIZE];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_buffer = cmsg_space!([RawFd; NUM_FDS]);

    let msg = recvmsg::<()>(conn, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())
        .context(error::RecvSnafu)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            fds = received;
        }
    }

    Ok((buf[..msg.bytes].to_vec(), fds))
}

pub fn send_retcode(conn: &mut UnixStream, rc: i32) -> Result<()> {
    conn.write_all(&rc.to_le_bytes()).context(error::SendRetcodeSnafu)
}

pub fn recv_retcode(conn: &mut UnixStream) -> Result<i32> {
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).context(error::RecvRetcodeSnafu)?;
    Ok(i32::from_le_bytes(buf))
}
