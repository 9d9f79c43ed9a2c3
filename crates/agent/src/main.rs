use clap::Parser;

use pw_agent::cli::{Cli, Command, ConfigCommand};
use pw_agent::config_store::ConfigStore;
use pw_agent::paths::AgentPaths;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = AgentPaths::resolve();

    match cli.command {
        // Default to running the agent when no subcommand is given.
        None | Some(Command::Run) => {
            let code = pw_agent::supervisor::run(paths).await?;
            std::process::exit(code);
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let store = ConfigStore::load(&paths.config_file())?;
            let mut config = store.snapshot();
            if config.auth_token.is_some() {
                config.auth_token = Some("<redacted>".into());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Path)) => {
            println!("{}", paths.config_file().display());
            Ok(())
        }
        Some(Command::Version) => {
            println!("procwarden {}", pw_agent::AGENT_VERSION);
            Ok(())
        }
    }
}
