use vbdiff::tool::DiffTool;
use vbdiff::{cli, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());
    telemetry::init(cli.verbose);

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("{err}");
            std::process::exit(1);
        }
    };

    let tool = match DiffTool::new(config) {
        Ok(tool) => tool,
        Err(err) => {
            tracing::error!("{err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = tool.run() {
        tracing::error!("{err}");
        std::process::exit(1);
    }
}
