//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::{Cli, CliError};

const BIN_NAME: &str = "avrflash";

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    generate(shell, &mut Cli::command(), BIN_NAME, &mut io::stdout());
}

/// Detect the user's current shell from environment.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }

    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }

    None
}

/// Map a shell binary path to its `Shell`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let shell_name = Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match shell_name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Where the completion script for `shell` is installed.
fn completion_install_path(shell: Shell, dirs: &BaseDirs) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => dirs
            .data_dir()
            .join("bash-completion/completions")
            .join(BIN_NAME),
        Shell::Zsh => dirs
            .home_dir()
            .join(".zfunc")
            .join(format!("_{BIN_NAME}")),
        Shell::Fish => dirs
            .config_dir()
            .join("fish/completions")
            .join(format!("{BIN_NAME}.fish")),
        Shell::Elvish => dirs
            .config_dir()
            .join("elvish/lib")
            .join(format!("{BIN_NAME}.elv")),
        Shell::PowerShell => dirs
            .config_dir()
            .join("powershell/completions")
            .join(format!("{BIN_NAME}.ps1")),
        _ => {
            return Err(CliError::Usage(format!("{shell} is not supported by --install")).into());
        },
    };
    Ok(path)
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg.or_else(detect_shell_type) {
        Some(shell) => shell,
        None => {
            return Err(CliError::Usage(format!(
                "Could not detect your shell. Please specify it explicitly:\n  \
                 {BIN_NAME} completions --install bash"
            ))
            .into());
        },
    };

    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = completion_install_path(shell, &dirs)?;

    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), BIN_NAME, &mut buf);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓")
            .green()
            .bold(),
        style(shell).cyan(),
        style(path.display()).yellow()
    );

    match shell {
        Shell::Bash => {
            eprintln!(
                "To activate now: {}",
                style(format!("source {}", path.display())).cyan()
            );
        },
        Shell::Zsh => {
            eprintln!("Make sure your ~/.zshrc contains:");
            eprintln!("  {}", style("fpath=(~/.zfunc $fpath)").cyan());
            eprintln!("  {}", style("autoload -Uz compinit && compinit").cyan());
        },
        Shell::PowerShell => {
            eprintln!("Add this to your PowerShell profile to load on startup:");
            eprintln!(
                "  {}",
                style(format!(". {}", path.display())).cyan()
            );
        },
        _ => {
            eprintln!("Completions will be loaded in new shell sessions.");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_from_path() {
        assert_eq!(shell_from_path("/bin/bash"), Some(Shell::Bash));
        assert_eq!(shell_from_path("/usr/bin/zsh"), Some(Shell::Zsh));
        assert_eq!(shell_from_path("/usr/local/bin/fish"), Some(Shell::Fish));
        assert_eq!(shell_from_path("elvish"), Some(Shell::Elvish));
        assert_eq!(shell_from_path("/opt/pwsh"), Some(Shell::PowerShell));
        assert_eq!(shell_from_path("/bin/tcsh"), None);
        assert_eq!(shell_from_path(""), None);
    }

    #[test]
    fn test_install_paths_use_binary_name() {
        let Some(dirs) = BaseDirs::new() else {
            return;
        };
        let expected = [
            (Shell::Bash, "avrflash"),
            (Shell::Zsh, "_avrflash"),
            (Shell::Fish, "avrflash.fish"),
            (Shell::Elvish, "avrflash.elv"),
            (Shell::PowerShell, "avrflash.ps1"),
        ];
        for (shell, file_name) in expected {
            let path = completion_install_path(shell, &dirs).unwrap();
            assert!(path.ends_with(file_name), "{shell}: {}", path.display());
        }
    }

    #[test]
    fn test_generated_script_mentions_subcommands() {
        let mut buf = Vec::new();
        generate(Shell::Bash, &mut Cli::command(), BIN_NAME, &mut buf);
        let script = String::from_utf8(buf).unwrap();
        assert!(script.contains("avrflash"));
        assert!(script.contains("list-ports"));
    }
}
