//! Command-line tokenizing and process identity matching.
//!
//! Launch, reconciliation and related-process discovery all tokenize a task
//! command through [`resolve_argv`] so that a process spawned from a command
//! is always recognised by the same command later on.

/// Split a raw command string into an argument vector.
///
/// POSIX hosts use shell quoting rules; Windows uses the native
/// `CommandLineToArgvW` parser. Whenever the platform parser rejects the
/// input (unbalanced quotes, allocation failure) the command is split on
/// whitespace instead. Never fails.
pub fn resolve_argv(command: &str) -> Vec<String> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    native_split(trimmed).unwrap_or_else(|| whitespace_split(trimmed))
}

fn whitespace_split(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

#[cfg(not(windows))]
fn native_split(command: &str) -> Option<Vec<String>> {
    shlex::split(command)
}

#[cfg(windows)]
fn native_split(command: &str) -> Option<Vec<String>> {
    use windows_sys::Win32::Foundation::LocalFree;
    use windows_sys::Win32::UI::Shell::CommandLineToArgvW;

    let wide: Vec<u16> = command.encode_utf16().chain(std::iter::once(0)).collect();
    let mut argc: i32 = 0;
    unsafe {
        let argv = CommandLineToArgvW(wide.as_ptr(), &mut argc);
        if argv.is_null() {
            return None;
        }
        let mut out = Vec::with_capacity(argc.max(0) as usize);
        for index in 0..argc.max(0) as usize {
            let arg = *argv.add(index);
            let mut len = 0usize;
            while *arg.add(len) != 0 {
                len += 1;
            }
            out.push(String::from_utf16_lossy(std::slice::from_raw_parts(arg, len)));
        }
        LocalFree(argv as _);
        Some(out)
    }
}

/// Rebuild a single command string from an argument vector, quoting where needed.
pub fn join_argv(argv: &[String]) -> String {
    #[cfg(not(windows))]
    {
        shlex::try_join(argv.iter().map(String::as_str)).unwrap_or_else(|_| argv.join(" "))
    }
    #[cfg(windows)]
    {
        argv.iter()
            .map(|arg| {
                if arg.is_empty() || arg.contains([' ', '\t']) {
                    format!("\"{}\"", arg.replace('"', "\\\""))
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Final path component of a token, accepting both separator styles.
pub fn basename(token: &str) -> &str {
    token.rsplit(['/', '\\']).next().unwrap_or(token)
}

/// True for `python`, `python3`, `/usr/bin/python3.11`, `C:\Python\python.exe`...
pub fn is_python_interpreter(token: &str) -> bool {
    basename(token).to_ascii_lowercase().starts_with("python")
}

/// True for a bare `python` / `python.exe` with no directory component.
pub fn is_unqualified_python(token: &str) -> bool {
    let lower = token.to_ascii_lowercase();
    lower == "python" || lower == "python.exe"
}

/// Does `argv` belong to a process launched from `command`?
pub fn matches_cmdline(command: &str, argv: &[String]) -> bool {
    matches_tokens(&resolve_argv(command), argv)
}

/// Token-level form of [`matches_cmdline`] for callers that tokenize once.
///
/// The target tokens must appear as a contiguous, ordered run somewhere in
/// `argv`. When the target starts with a python-family interpreter the run
/// may also skip that interpreter token, since the configured interpreter
/// path rarely matches the one the kernel reports.
pub fn matches_tokens(target: &[String], argv: &[String]) -> bool {
    if target.is_empty() || argv.is_empty() {
        return false;
    }
    if contains_run(argv, target) {
        return true;
    }
    if target.len() > 1 && is_python_interpreter(&target[0]) {
        return contains_run(argv, &target[1..]);
    }
    false
}

fn contains_run(haystack: &[String], needle: &[String]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|window| window.iter().zip(needle).all(|(a, b)| a.trim() == b.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[cfg(unix)]
    #[test]
    fn resolves_shell_quoting() {
        assert_eq!(
            resolve_argv(r#"python "my script.py" --name 'a b'"#),
            argv(&["python", "my script.py", "--name", "a b"])
        );
    }

    #[cfg(unix)]
    #[test]
    fn unbalanced_quotes_fall_back_to_whitespace() {
        assert_eq!(resolve_argv(r#"echo "oops"#), argv(&["echo", "\"oops"]));
    }

    #[test]
    fn empty_command_yields_no_tokens() {
        assert!(resolve_argv("   ").is_empty());
        assert!(!matches_cmdline("", &argv(&["sleep", "1"])));
    }

    #[test]
    fn contiguous_subsequence_matches() {
        let live = argv(&["/bin/sh", "-c", "worker", "--port", "80", "--verbose"]);
        assert!(matches_cmdline("worker --port 80", &live));
        assert!(matches_cmdline("--port 80", &live));
    }

    #[test]
    fn missing_or_reordered_token_does_not_match() {
        let live = argv(&["worker", "--port", "80"]);
        assert!(!matches_cmdline("worker --port 81", &live));
        assert!(!matches_cmdline("worker 80 --port", &live));
        assert!(!matches_cmdline("worker --port 80 --verbose", &live));
    }

    #[test]
    fn gapped_subsequence_is_rejected() {
        let live = argv(&["worker", "--verbose", "--port", "80"]);
        assert!(!matches_cmdline("worker --port 80", &live));
    }

    #[test]
    fn python_interpreter_token_may_differ() {
        let live = argv(&["/opt/venv/bin/python3.11", "serve.py", "--port", "9000"]);
        assert!(matches_cmdline("python serve.py --port 9000", &live));
        assert!(!matches_cmdline("python serve.py --port 9001", &live));
        assert!(!matches_cmdline("node serve.py --port 9000", &live));
    }

    #[test]
    fn python_detection_covers_paths_and_suffixes() {
        assert!(is_python_interpreter("python"));
        assert!(is_python_interpreter("/usr/bin/python3"));
        assert!(is_python_interpreter(r"C:\Python311\Python.exe"));
        assert!(!is_python_interpreter("ipython-notebook/../node"));
        assert!(is_unqualified_python("Python.exe"));
        assert!(!is_unqualified_python("/usr/bin/python"));
    }

    #[cfg(unix)]
    #[test]
    fn join_quotes_arguments_with_spaces() {
        let joined = join_argv(&argv(&["python", "my script.py"]));
        assert_eq!(resolve_argv(&joined), argv(&["python", "my script.py"]));
    }
}
