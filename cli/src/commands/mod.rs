pub mod config;
pub mod generate;
pub mod prepare;
pub mod serve;

use pictor_core::Config;

/// Load the config file and apply the flags shared by the model commands
pub fn load_config(cpu: bool) -> anyhow::Result<Config> {
    let mut config = Config::load()?;
    if cpu {
        config.model.use_gpu = false;
    }
    Ok(config)
}
