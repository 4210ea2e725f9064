//! Rootless container engine: user-namespace sandbox lifecycle, idmap
//! derivation, and the bind-mount/env/capability policy used to launch the
//! sandbox (`af-jailer`) and build or refresh a container directory.

pub mod container;
pub mod error;
pub mod idmap;

pub use container::{
    cont_bootstrap, cont_make, cont_refresh, cont_refresh_skeleton, Container, MakeOptions, RunOptions, MOUNTS,
};
pub use error::{Error, Result};
pub use idmap::{derive as derive_idmap, IdmapTriple};
