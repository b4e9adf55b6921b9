pub mod error;
pub mod load;
pub mod paths;
pub mod settings;

pub use error::ConfigError;
pub use load::{load_plan, load_settings};
pub use paths::{
    default_global_config_path, default_state_root_path, GLOBAL_SETTINGS_FILE_NAME,
    GLOBAL_STATE_DIR,
};
pub use settings::{
    HostKeyPolicy, Settings, SshSettings, StoreKind, DEFAULT_COMMAND_TIMEOUT_SECONDS,
    DEFAULT_INTERACTION_TIMEOUT_SECONDS, DEFAULT_MAX_OUTPUT_BYTES,
};
