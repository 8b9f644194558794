use lua_bridge::config::{init_logging, BridgeConfig};
use lua_bridge::{BridgeError, ScriptBridge};

fn run(files: &[String]) -> Result<(), BridgeError> {
    let mut config = BridgeConfig::load_or_default();
    config.apply_env_overrides();
    init_logging(&config.logging);

    let bridge = ScriptBridge::with_config(config)?;
    for file in files {
        tracing::info!(target: "script_bridge", "Running {}", file);
        bridge.eval_file(file)?;
    }
    Ok(())
}

fn main() {
    let files: Vec<String> = std::env::args().skip(1).collect();
    if files.is_empty() {
        eprintln!("usage: lua-bridge <script.lua>...");
        std::process::exit(2);
    }
    if let Err(e) = run(&files) {
        eprintln!("lua-bridge failed: {}", e);
        std::process::exit(e.status_code());
    }
}
