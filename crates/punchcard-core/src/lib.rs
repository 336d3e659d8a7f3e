mod config;
mod critical;
mod error;
mod fs_utils;
mod layout;
mod ops_log;
mod release;
mod version;

pub use config::{
    BackupConfig, CheckConfig, FeatureFlags, RegistryConfig, TransferConfig, UpdaterConfig,
    DEFAULT_CONFIG_FILE, TOKEN_ENV_VAR,
};
pub use critical::{normalize_relative_path, CriticalPathSet};
pub use error::{UpdateError, UpdateResult};
pub use fs_utils::{
    collect_files, copy_dir_filtered, copy_dir_recursive, path_size, remove_path_if_exists,
    replace_file_staged,
};
pub use layout::InstallLayout;
pub use ops_log::{OpsEntry, OpsLevel, OpsLog};
pub use release::ReleaseDescriptor;
pub use version::{
    is_update_available, parse_version_tag, read_installed_marker, write_installed_marker,
};
