//! Generation of the scripts mounted into job pods.
//!
//! Every job pod mounts a config map with one bootstrap script plus one
//! script per stage. Stage scripts are self-reporting: they append a start
//! sentinel to the shared log file, run the user's script with errexit
//! semantics, and an exit trap appends the exit sentinel carrying the stage's
//! exit code. The sentinels are written directly to the log file rather than
//! to stdout so they cannot be reordered against the stage's own output by
//! the container's output pipeline.

use crate::Shell;

/// Locates a usable Bourne-compatible shell inside the image and replaces
/// itself with it, forwarding all arguments.
///
/// Build images range from full distributions to single-binary images with
/// only a busybox shell, so the well-known locations are probed in order of
/// preference.
pub const DETECT_SHELL_SCRIPT: &str = r#"if [ -x /usr/local/bin/bash ]; then
	exec /usr/local/bin/bash "$@"
elif [ -x /usr/bin/bash ]; then
	exec /usr/bin/bash "$@"
elif [ -x /bin/bash ]; then
	exec /bin/bash "$@"
elif [ -x /usr/local/bin/sh ]; then
	exec /usr/local/bin/sh "$@"
elif [ -x /usr/bin/sh ]; then
	exec /usr/bin/sh "$@"
elif [ -x /bin/sh ]; then
	exec /bin/sh "$@"
elif [ -x /busybox/sh ]; then
	exec /busybox/sh "$@"
else
	echo shell not found
	exit 1
fi
"#;

/// Validates and executes a stage script with PowerShell.
///
/// Invoking the stage script through this wrapper surfaces parse errors as a
/// failing stage instead of an interpreter hang, and normalizes the exit
/// code of script-terminating errors to 1.
pub const PWSH_BOOTSTRAP_SCRIPT: &str = r#"param (
	[Parameter(Mandatory = $true, Position = 0)]
	[string]$Path
)
$ErrorActionPreference = 'Stop'
$tokens = $null
$errors = $null
[System.Management.Automation.Language.Parser]::ParseFile($Path, [ref]$tokens, [ref]$errors) | Out-Null
if ($errors.Count -gt 0) {
	$errors | ForEach-Object { Write-Error $_ -ErrorAction Continue }
	exit 1
}
& $Path
if ($null -eq $LASTEXITCODE) {
	exit 0
}
exit $LASTEXITCODE
"#;

/// An error generating a stage script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The shell cannot execute scripts provided through a config map.
    #[error("shell `{0}` requires scripts to be passed as files")]
    UnsupportedShell(Shell),
}

/// Generates the stage script for the given shell.
///
/// `log_file` is the absolute path of the shared log file inside the pod and
/// `body` is the user-provided script for the stage.
pub fn stage_script(shell: Shell, log_file: &str, body: &str) -> Result<String, ScriptError> {
    match shell {
        Shell::Bash => Ok(bash_stage_script(log_file, body)),
        Shell::Pwsh => Ok(pwsh_stage_script(log_file, body)),
        Shell::Cmd => Err(ScriptError::UnsupportedShell(shell)),
    }
}

/// Generates a POSIX stage script.
///
/// `$0` is the path the script was invoked as, which is the config-map
/// projection path of the stage script; it identifies the stage in both
/// sentinels.
fn bash_stage_script(log_file: &str, body: &str) -> String {
    format!(
        r#"kiln_marker="$(printf '\037')"
kiln_trap_exit() {{
	kiln_exit_code=$?
	printf '%s\n' "${{kiln_marker}}TRAP${{kiln_marker}}{{\"command_exit_code\":${{kiln_exit_code}},\"script\":\"$0\"}}${{kiln_marker}}" >> '{log_file}'
	exit "${{kiln_exit_code}}"
}}
trap kiln_trap_exit EXIT
printf '%s\n' "${{kiln_marker}}TRAP${{kiln_marker}}{{\"script\":\"$0\"}}${{kiln_marker}}" >> '{log_file}'
set -e
{body}
"#
    )
}

/// Generates a PowerShell stage script.
///
/// PowerShell has no equivalent of a POSIX `EXIT` trap, so the user script
/// runs inside `try`/`finally`; `$PSCommandPath` plays the role of `$0`.
fn pwsh_stage_script(log_file: &str, body: &str) -> String {
    format!(
        r#"$ErrorActionPreference = 'Stop'
$KilnMarker = [char]0x1F
$KilnExitCode = 0
Add-Content -Path '{log_file}' -Value "$($KilnMarker)TRAP$($KilnMarker){{`"script`":`"$PSCommandPath`"}}$($KilnMarker)"
try {{
{body}
	if ($null -ne $LASTEXITCODE) {{
		$KilnExitCode = $LASTEXITCODE
	}}
}} catch {{
	Write-Error $_ -ErrorAction Continue
	$KilnExitCode = 1
}} finally {{
	Add-Content -Path '{log_file}' -Value "$($KilnMarker)TRAP$($KilnMarker){{`"command_exit_code`":$KilnExitCode,`"script`":`"$PSCommandPath`"}}$($KilnMarker)"
}}
exit $KilnExitCode
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bash_stage_script_traps_and_reports() {
        let script = stage_script(Shell::Bash, "/logs-1-2/output.log", "echo hi").unwrap();

        assert!(script.contains("trap kiln_trap_exit EXIT"));
        assert!(script.contains(r#">> '/logs-1-2/output.log'"#));
        assert!(script.contains(r#"\"command_exit_code\":${kiln_exit_code}"#));
        assert!(script.contains("echo hi"));

        // The start sentinel is written before the user script runs.
        let start = script.find(r#"{\"script\":\"$0\"}"#).unwrap();
        assert!(start < script.find("echo hi").unwrap());
    }

    #[test]
    fn pwsh_stage_script_reports_from_finally() {
        let script = stage_script(Shell::Pwsh, "C:\\logs\\output.log", "dotnet build").unwrap();

        assert!(script.contains("} finally {"));
        assert!(script.contains("dotnet build"));
        assert!(script.contains("`\"command_exit_code`\":$KilnExitCode"));
        assert!(script.contains("exit $KilnExitCode"));
    }

    #[test]
    fn cmd_is_rejected() {
        let err = stage_script(Shell::Cmd, "/logs/output.log", "echo hi").unwrap_err();
        assert!(matches!(err, ScriptError::UnsupportedShell(Shell::Cmd)));
    }

    #[test]
    fn detect_shell_script_probes_busybox_last() {
        let bash = DETECT_SHELL_SCRIPT.find("/usr/local/bin/bash").unwrap();
        let busybox = DETECT_SHELL_SCRIPT.find("/busybox/sh").unwrap();
        assert!(bash < busybox);
    }
}
