use std::path::PathBuf;

/// Returns the default control socket path for the devwatch daemon.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("devwatch.sock")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/devwatch-{uid}.sock"))
    }
}

/// Returns the config directory path for devwatch.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("devwatch")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("devwatch")
    } else {
        PathBuf::from("/tmp/devwatch")
    }
}

/// Returns the data directory holding the registry file and session logs.
pub fn data_dir() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(data_home).join("devwatch")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local").join("share").join("devwatch")
    } else {
        PathBuf::from("/tmp/devwatch/data")
    }
}

/// Returns the default PID file path for the devwatch daemon.
pub fn pid_file_path() -> PathBuf {
    dirs_path().join("devwatchd.pid")
}

/// Returns the config file path for the devwatch daemon.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}
