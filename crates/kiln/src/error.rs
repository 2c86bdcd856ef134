use std::path::PathBuf;

use kiln_exec::{ConfigError, ExecError};

use crate::assets::AssetError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("source directory {} does not exist", .0.display())]
    MissingSource(PathBuf),

    #[error("failed to resolve {}: {source}", path.display())]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output directory {} is inside source directory {}", dst.display(), src.display())]
    NestedOutput { src: PathBuf, dst: PathBuf },

    #[error("asset copy failed: {0}")]
    Assets(#[from] ExecError<AssetError>),
}
