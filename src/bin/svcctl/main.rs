//! svcctl
//!
//! Command-line front end for `service_ctl`.

#![cfg_attr(not(windows), allow(dead_code))]

mod args;
mod logging;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use service_ctl::ControlConfig;
use tracing::error;

use args::{Args, Command};

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(&args);

    match load_config(&args).and_then(|config| run(args.command, config)) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

fn load_config(args: &Args) -> Result<ControlConfig> {
    match &args.config {
        Some(path) => ControlConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(ControlConfig::default()),
    }
}

fn exit_status(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(windows)]
fn run(command: Command, config: ControlConfig) -> Result<ExitCode> {
    use service_ctl::{ScmAuthority, ServiceController, ServiceInfo};

    let controller = ServiceController::with_config(ScmAuthority, config);

    match command {
        Command::Create {
            name,
            path,
            auto,
            display_name,
            launch_arguments,
        } => {
            let mut service_info =
                ServiceInfo::new(&name, path, auto).with_launch_arguments(launch_arguments);
            if let Some(display_name) = display_name {
                service_info = service_info.with_display_name(display_name);
            }
            controller.create(&service_info)?;
        }
        Command::Start { name } => controller.start(name)?,
        Command::Stop { name } => controller.stop(name)?,
        Command::Delete { name } => controller.delete(name)?,
        Command::Status { name } => println!("{}", controller.query_status(name)?),
        Command::Exists { name } => return Ok(exit_status(controller.exists(name)?)),
        Command::Hide { name } => controller.set_hidden(name)?,
        Command::Show { name } => controller.set_visible(name)?,
        Command::IsHidden { name } => {
            let hidden = controller.is_hidden(name)?;
            println!("{}", if hidden { "hidden" } else { "visible" });
        }
        Command::Recovery { name } => controller.set_recovery_actions(name)?,
        Command::IsAdmin => return Ok(exit_status(service_ctl::is_admin())),
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(not(windows))]
fn run(_command: Command, _config: ControlConfig) -> Result<ExitCode> {
    anyhow::bail!("svcctl controls windows services and only runs on windows")
}
