mod capture;
mod cli;
mod export;
mod paths;
mod run;
mod source;

use anyhow::Result;
use cli::{Command, DefaultsAction};
use paths::AppPaths;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    match cli.command {
        Some(Command::Capture(args)) => run::run_capture(&cli.run, args),
        Some(Command::Defaults(defaults_cmd)) => handle_defaults_command(defaults_cmd.action),
        None => run::run_window(&cli.run),
    }
}

fn handle_defaults_command(action: DefaultsAction) -> Result<()> {
    let paths = AppPaths::discover()?;
    match action {
        DefaultsAction::Where => run_defaults_where(&paths),
    }
}

fn run_defaults_where(paths: &AppPaths) -> Result<()> {
    println!("Configuration directories:");
    println!("  config:     {}", paths.config_dir().display());
    println!("  data:       {}", paths.data_dir().display());
    println!("  pictures:   {}", paths.pictures_dir().display());
    println!("  config file: {}", paths.config_file().display());
    Ok(())
}
