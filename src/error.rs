use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Construction-time capability failure. Fatal for the component that hit it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("device lacks required downlevel capability {0:?}")]
    MissingCapability(wgpu::DownlevelFlags),
    #[error("device limit {limit} is {available}, at least {required} is required")]
    LimitTooLow {
        limit: &'static str,
        required: u64,
        available: u64,
    },
    #[error("no compatible adapter was found")]
    NoAdapter,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// The component failed its capability check and refuses to dispatch.
    #[error("{0} is not valid on this device")]
    Invalid(&'static str),

    #[error("element count {count} outside supported range 1..={max}")]
    InvalidCount { count: u32, max: u32 },

    #[error("key bit count {0} outside 1..=32")]
    InvalidKeyBits(u32),

    #[error("{what} needs {required} elements but only {capacity} are available")]
    CapacityExceeded {
        what: &'static str,
        required: usize,
        capacity: usize,
    },

    #[error("splat field {field} has {found} entries, expected {expected}")]
    InconsistentSplatData {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("no scene has been prepared")]
    SceneNotPrepared,

    #[error("viewport {0}x{1} has no pixels")]
    EmptyViewport(u32, u32),
}
