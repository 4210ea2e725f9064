//! Entity types, the status bitflag lattice, and MQTT topic derivation
//! shared by every other crate in the workspace.

mod entities;
mod status;

pub use entities::{Arch, Builder, Event, EventType, Job, Task};
pub use status::Status;

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum ModelError {
    #[snafu(display("malformed MQTT payload: {source}"))]
    Payload { source: serde_json::Error },
}

impl From<serde_json::Error> for ModelError {
    fn from(source: serde_json::Error) -> Self {
        ModelError::Payload { source }
    }
}
