use std::path::PathBuf;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(tool_gateway::run(config_path));

    // A stdin read still parked on a blocking thread must not hold up exit.
    runtime.shutdown_timeout(Duration::from_millis(200));
    result
}
