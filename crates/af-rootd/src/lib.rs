//! The in-process root daemon: a strict, audited whitelist of privileged
//! operations a build running as an unprivileged user inside the sandbox may
//! request, brokered over a connected Unix socket (spec §4.2, §6.2).

mod error;
pub mod server;
pub mod validate;
pub mod wire;

pub use error::{Error, Result};
pub use server::serve;
