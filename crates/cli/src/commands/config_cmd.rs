//! `parley config` — Print the default configuration or the config path.

use std::path::Path;

use parley_config::AppConfig;

pub fn run(config_path: Option<&Path>, path_only: bool) {
    if path_only {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));
        println!("{}", path.display());
    } else {
        print!("{}", AppConfig::default_toml());
    }
}
