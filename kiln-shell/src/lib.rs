//! Stage script generation for the kiln Kubernetes executor.
//!
//! Build containers run a long-lived shell that is fed commands over an
//! attach stream. The scripts generated here are what those commands invoke:
//! a bootstrap script that locates a usable shell inside arbitrary images,
//! and one script per job stage that runs the user's script under an exit
//! trap. The trap reports the stage outcome by appending a sentinel line to
//! the shared log file; the [`sentinel`] module defines that wire format.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

pub mod script;
pub mod sentinel;

pub use script::DETECT_SHELL_SCRIPT;
pub use script::PWSH_BOOTSTRAP_SCRIPT;
pub use script::stage_script;
pub use sentinel::TrapExitStatus;

/// The config-map key of the POSIX shell detection script.
pub const DETECT_SHELL_SCRIPT_NAME: &str = "detect_shell_script";

/// The config-map key of the PowerShell bootstrap script.
///
/// The `.ps1` extension is required for `pwsh` to accept the file as a
/// script when invoked by path.
pub const PWSH_BOOTSTRAP_SCRIPT_NAME: &str = "parse_pwsh_script.ps1";

/// The shell used to execute stage scripts inside job containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    /// Bourne-compatible shells, located at runtime by the detection script.
    #[default]
    Bash,
    /// PowerShell Core, used for Windows-image jobs.
    Pwsh,
    /// The Windows command interpreter.
    ///
    /// `cmd` can only execute scripts passed as files, which the executor
    /// does not support; it is accepted here so configuration parsing can
    /// produce a precise rejection later.
    Cmd,
}

impl Shell {
    /// Whether the shell can only execute scripts passed as a file.
    pub fn requires_script_file(self) -> bool {
        matches!(self, Self::Cmd)
    }

    /// The config-map key of the bootstrap script for this shell.
    pub fn bootstrap_script_name(self) -> &'static str {
        match self {
            Self::Bash | Self::Cmd => DETECT_SHELL_SCRIPT_NAME,
            Self::Pwsh => PWSH_BOOTSTRAP_SCRIPT_NAME,
        }
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bash => write!(f, "bash"),
            Self::Pwsh => write!(f, "pwsh"),
            Self::Cmd => write!(f, "cmd"),
        }
    }
}

/// An error parsing a [`Shell`] from its configured name.
#[derive(Debug, thiserror::Error)]
#[error("unknown shell `{0}`")]
pub struct UnknownShellError(String);

impl FromStr for Shell {
    type Err = UnknownShellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bash" | "sh" => Ok(Self::Bash),
            "pwsh" | "powershell" => Ok(Self::Pwsh),
            "cmd" => Ok(Self::Cmd),
            _ => Err(UnknownShellError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_names_round_trip() {
        for shell in [Shell::Bash, Shell::Pwsh, Shell::Cmd] {
            assert_eq!(shell.to_string().parse::<Shell>().unwrap(), shell);
        }

        assert!("fish".parse::<Shell>().is_err());
    }

    #[test]
    fn only_cmd_requires_a_script_file() {
        assert!(Shell::Cmd.requires_script_file());
        assert!(!Shell::Bash.requires_script_file());
        assert!(!Shell::Pwsh.requires_script_file());
    }
}
