use std::path::{Path, PathBuf};

use super::InstallError;

/// Longest shebang the kernel honors directly; anything longer (or with
/// whitespace in the interpreter path) needs the `/bin/sh` trampoline.
const SHEBANG_MAX_LENGTH: usize = 127;

/// Builds the shebang block for a script run by `python`.
///
/// The plain `#!{python}` form breaks when the interpreter path contains
/// whitespace or exceeds the kernel's shebang length limit, so those cases
/// use the two-line `/bin/sh` exec trampoline, which preserves argv.
pub fn shebang_for(python: &Path) -> String {
    let python = dunce::simplified(python).display().to_string();
    let simple = format!("#!{python}");
    if simple.len() <= SHEBANG_MAX_LENGTH && !python.contains(char::is_whitespace) {
        simple
    } else {
        format!("#!/bin/sh\n'''exec' \"{python}\" \"$0\" \"$@\"\n' '''")
    }
}

/// Assembles a launcher script: shebang block plus python body.
pub fn make_launcher(python: &Path, body: &[u8]) -> Vec<u8> {
    let mut script = shebang_for(python).into_bytes();
    script.push(b'\n');
    script.extend_from_slice(body);
    script
}

/// Rewrites the interpreter path in every launcher under `scripts_dir`,
/// returning the scripts that were changed.
///
/// Recognizes both the simple `#!...python...` form and the `/bin/sh` exec
/// trampoline; only the path token is touched, the script body is preserved
/// byte for byte. Native launchers (`.exe`) are opaque on posix and skipped.
pub fn rewrite_shebangs(
    scripts_dir: &Path,
    new_interpreter: &Path,
) -> Result<Vec<PathBuf>, InstallError> {
    let mut rewritten = Vec::new();
    if !scripts_dir.is_dir() {
        return Ok(rewritten);
    }
    for entry in fs_err::read_dir(scripts_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        if path.extension().is_some_and(|ext| ext == "exe") {
            tracing::debug!("skipping native launcher {}", path.display());
            continue;
        }
        let Ok(content) = fs_err::read(&path) else {
            continue;
        };
        if let Some(updated) = rewrite_script(&content, new_interpreter) {
            crate::utils::atomic_replace(&path, &updated)?;
            restore_executable_bit(&path)?;
            rewritten.push(path);
        }
    }
    Ok(rewritten)
}

/// Rewrites the shebang of one script, or returns `None` when the content is
/// not a python launcher.
fn rewrite_script(content: &[u8], new_interpreter: &Path) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(content).ok()?;
    let mut lines = text.splitn(2, '\n');
    let first = lines.next()?;
    let rest = lines.next().unwrap_or("");

    if first.starts_with("#!/bin/sh") {
        // Trampoline form: the path token lives on the second line.
        let mut rest_lines = rest.splitn(2, '\n');
        let exec_line = rest_lines.next()?;
        let body = rest_lines.next().unwrap_or("");
        if !(exec_line.starts_with("'''exec'") && exec_line.ends_with("\"$0\" \"$@\"")) {
            return None;
        }
        // The `' '''` closing line belongs to the trampoline block.
        let body = body.strip_prefix("' '''\n").unwrap_or(body);
        let new_block = shebang_for(new_interpreter);
        return Some(format!("{new_block}\n{body}").into_bytes());
    }

    if first.starts_with("#!") && first.contains("python") {
        let new_block = shebang_for(new_interpreter);
        return Some(format!("{new_block}\n{rest}").into_bytes());
    }

    None
}

#[cfg(unix)]
fn restore_executable_bit(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs_err::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn restore_executable_bit(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_shebang_for_short_paths() {
        let shebang = shebang_for(Path::new("/usr/bin/python3"));
        assert_eq!(shebang, "#!/usr/bin/python3");
    }

    #[test]
    fn trampoline_for_paths_with_whitespace() {
        let shebang = shebang_for(Path::new("/opt/my python/bin/python"));
        assert!(shebang.starts_with("#!/bin/sh\n"));
        assert!(shebang.contains("'''exec' \"/opt/my python/bin/python\" \"$0\" \"$@\""));
    }

    #[test]
    fn trampoline_for_very_long_paths() {
        let long = format!("/{}/bin/python", "x".repeat(130));
        let shebang = shebang_for(Path::new(&long));
        assert!(shebang.starts_with("#!/bin/sh\n"));
    }

    #[test]
    fn rewrite_simple_shebang() {
        let script = b"#!/old/venv/bin/python\nimport sys\nprint(sys.argv)\n";
        let updated = rewrite_script(script, Path::new("/new/venv/bin/python")).unwrap();
        let text = String::from_utf8(updated).unwrap();
        assert!(text.starts_with("#!/new/venv/bin/python\n"));
        assert!(text.ends_with("import sys\nprint(sys.argv)\n"));
    }

    #[test]
    fn rewrite_trampoline_shebang() {
        let script = shebang_for(Path::new("/old weird/python")).into_bytes();
        let mut script = script;
        script.extend_from_slice(b"\nimport sys\n");
        let updated = rewrite_script(&script, Path::new("/usr/bin/python3")).unwrap();
        let text = String::from_utf8(updated).unwrap();
        // The replacement interpreter is unproblematic, so the simple form
        // comes back.
        assert!(text.starts_with("#!/usr/bin/python3\n"));
        assert!(text.ends_with("import sys\n"));
    }

    #[test]
    fn non_python_scripts_are_left_alone() {
        assert!(rewrite_script(b"#!/bin/bash\necho hi\n", Path::new("/p")).is_none());
        assert!(rewrite_script(b"\x7fELF binary", Path::new("/p")).is_none());
    }
}
