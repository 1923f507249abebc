//! Command-line argument parsing

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Control the lifecycle, recovery and visibility of windows services.
#[derive(Parser, Debug)]
#[command(name = "svcctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// TOML file with stop timeout, poll interval and recovery policy
    #[arg(short = 'c', long, value_name = "FILE", global = true, env = "SVCCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register a service and install the recovery policy on it
    Create {
        name: OsString,

        /// Path to the service executable
        path: PathBuf,

        /// Start the service at boot instead of on demand
        #[arg(long)]
        auto: bool,

        /// Name shown in the services console
        #[arg(long, value_name = "NAME")]
        display_name: Option<OsString>,

        /// Arguments passed to the service when it is launched
        #[arg(last = true)]
        launch_arguments: Vec<OsString>,
    },

    /// Start a service
    Start { name: OsString },

    /// Stop a service and wait until it has stopped
    Stop { name: OsString },

    /// Delete a service
    Delete { name: OsString },

    /// Print the current state of a service
    Status { name: OsString },

    /// Exit with status 0 if the service is registered, 1 otherwise
    Exists { name: OsString },

    /// Restrict the service to the system and administrators
    Hide { name: OsString },

    /// Restore default access to the service
    Show { name: OsString },

    /// Print whether the service appears hidden
    IsHidden { name: OsString },

    /// Install the configured recovery policy on an existing service
    Recovery { name: OsString },

    /// Exit with status 0 if running as an administrator, 1 otherwise
    IsAdmin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create() {
        let args = Args::parse_from([
            "svcctl",
            "create",
            "my_service",
            r"C:\Program Files\My Service\service.exe",
            "--auto",
            "--display-name",
            "My Service",
            "--",
            "--run-as-service",
        ]);
        match args.command {
            Command::Create {
                name,
                path,
                auto,
                display_name,
                launch_arguments,
            } => {
                assert_eq!(name, "my_service");
                assert_eq!(path, PathBuf::from(r"C:\Program Files\My Service\service.exe"));
                assert!(auto);
                assert_eq!(display_name, Some(OsString::from("My Service")));
                assert_eq!(launch_arguments, vec![OsString::from("--run-as-service")]);
            }
            command => panic!("unexpected command {:?}", command),
        }
    }

    #[test]
    fn test_global_flags() {
        let args = Args::parse_from(["svcctl", "stop", "my_service", "-vv", "--config", "svc.toml"]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.config, Some(PathBuf::from("svc.toml")));
        assert!(matches!(args.command, Command::Stop { .. }));

        let args = Args::parse_from(["svcctl", "-q", "is-admin"]);
        assert!(args.quiet);
        assert!(matches!(args.command, Command::IsAdmin));
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Args::try_parse_from(["svcctl", "-q", "-v", "status", "my_service"]).is_err());
    }
}
