#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ResolveError {
    #[error("{}", collisions(.names))]
    EnvCollision { names: Vec<String> },

    #[error("volume for the Volume Mount {0:?} is not found")]
    VolumeNotFound(String),

    #[error("Cannot override BuildVolume {0:?}")]
    VolumeNotOverridable(String),

    #[error("BuildStrategy Volume {0:?} is listed more than once")]
    DuplicateStrategyVolume(String),

    #[error("Volume Mount {0:?} must be read only")]
    VolumeMountNotReadOnly(String),

    #[error("the parameter {param:?} is not defined in the build strategy {strategy:?}")]
    UndefinedParameter { param: String, strategy: String },
}

fn collisions(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("environment variable {name:?} already exists"))
        .collect::<Vec<_>>()
        .join(", ")
}
