use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("message of {len} bytes exceeds the {limit}-byte frame limit"))]
    MessageTooLarge { len: usize, limit: usize },

    #[snafu(display("failed to send on the root daemon socket"))]
    Send { source: nix::Error },

    #[snafu(display("failed to receive on the root daemon socket"))]
    Recv { source: nix::Error },

    #[snafu(display("failed to write a retcode frame"))]
    SendRetcode { source: std::io::Error },

    #[snafu(display("failed to read a retcode frame"))]
    RecvRetcode { source: std::io::Error },

    #[snafu(display("short read of {n} bytes reading a retcode frame"))]
    ShortRead { n: usize },

    #[snafu(display("failed to accept a connection on the root daemon socket"))]
    Accept { source: std::io::Error },

    #[snafu(display("container re-entry failed"))]
    Container { source: af_container::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
