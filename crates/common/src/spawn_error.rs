use std::io;
use thiserror::Error;

/// A process-spawn failure annotated with an actionable hint.
///
/// The OS error text is always kept verbatim; the hint is appended after it.
#[derive(Debug, Error)]
#[error("Failed to start `{program}`: {source}{}", hint_suffix(.hint))]
pub struct SpawnError {
    pub program: String,
    pub hint: Option<String>,
    #[source]
    pub source: io::Error,
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(hint) => format!(" (hint: {hint})"),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    NotFound,
    NotExecutable,
    Other,
}

/// ENOEXEC on Unix.
const ENOEXEC: i32 = 8;
/// ERROR_BAD_EXE_FORMAT on Windows.
const ERROR_BAD_EXE_FORMAT: i32 = 193;

fn failure_kind(err: &io::Error) -> FailureKind {
    if err.kind() == io::ErrorKind::NotFound {
        return FailureKind::NotFound;
    }
    match err.raw_os_error() {
        Some(code) if cfg!(unix) && code == ENOEXEC => return FailureKind::NotExecutable,
        Some(code) if cfg!(windows) && code == ERROR_BAD_EXE_FORMAT => {
            return FailureKind::NotExecutable
        }
        _ => {}
    }
    if err.kind() == io::ErrorKind::PermissionDenied {
        // Executing a script without the exec bit surfaces as EACCES.
        return FailureKind::NotExecutable;
    }
    let text = err.to_string().to_ascii_lowercase();
    if text.contains("exec format") || text.contains("not a valid win32 application") {
        FailureKind::NotExecutable
    } else {
        FailureKind::Other
    }
}

fn extension_hint(program: &str) -> Option<&'static str> {
    let lower = program.to_ascii_lowercase();
    if lower.ends_with(".py") {
        Some("python scripts must be run through the interpreter, e.g. `python script.py`")
    } else if lower.ends_with(".ps1") {
        Some("run PowerShell scripts with `powershell -File script.ps1`")
    } else if lower.ends_with(".vbs") {
        Some("run VBScript through the script host: `cscript //Nologo script.vbs`")
    } else if lower.ends_with(".sh") {
        Some("shell scripts cannot run directly outside a POSIX-compatible shell; use `sh script.sh` or `bash script.sh`")
    } else {
        None
    }
}

/// Classify a spawn failure for `argv` and attach a hint when one applies.
pub fn classify_spawn_error(err: io::Error, argv: &[String]) -> SpawnError {
    let program = argv.first().cloned().unwrap_or_default();
    let hint = match failure_kind(&err) {
        FailureKind::Other => None,
        FailureKind::NotFound | FailureKind::NotExecutable => Some(
            argv.iter()
                .find_map(|arg| extension_hint(arg))
                .unwrap_or("use an absolute path or make sure the executable is on PATH")
                .to_string(),
        ),
    };
    SpawnError {
        program,
        hint,
        source: err,
    }
}
