//! What a bridge runs: target path validation and command selection.

use crate::config::Config;
use crate::error::StartError;
use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::process::Command;

/// Environment applied on top of the server's own for every child.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("PYTHONIOENCODING", "utf-8"),
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONUTF8", "1"),
];

/// The thing an execution request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A script relative to the root; `None` means the configured default.
    Script(Option<String>),
    /// The configured interactive shell.
    Shell,
}

impl Target {
    pub(crate) fn launch(&self, config: &Config) -> Result<Launch, StartError> {
        match self {
            Target::Script(file) => {
                let file = match file.as_deref().or(config.default_file.as_deref()) {
                    Some(file) => file,
                    None => return Err(StartError::EmptyTarget),
                };
                let path = resolve_target(&config.root, file)?;
                script_launch(config, path)
            }
            Target::Shell => Ok(Launch::new(&config.shell)),
        }
    }
}

/// Map a client-supplied relative path onto an existing file under `root`.
///
/// `root` must already be canonical.
pub fn resolve_target(root: &Path, file: &str) -> Result<PathBuf, StartError> {
    let file = file.trim();
    if file.is_empty() {
        return Err(StartError::EmptyTarget);
    }

    let joined = root.join(file);
    let resolved = match joined.canonicalize() {
        Ok(path) => path,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if !normalize(&joined).starts_with(root) {
                return Err(StartError::OutsideRoot(file.to_string()));
            }
            return Err(StartError::Missing(file.to_string()));
        }
        Err(_) => return Err(StartError::Missing(file.to_string())),
    };

    if !resolved.starts_with(root) {
        return Err(StartError::OutsideRoot(file.to_string()));
    }
    if !resolved.is_file() {
        return Err(StartError::NotAFile(file.to_string()));
    }
    Ok(resolved)
}

/// Lexically collapse `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn script_launch(config: &Config, path: PathBuf) -> Result<Launch, StartError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("py") => {
            let python = config
                .interpreter
                .as_deref()
                .ok_or_else(|| StartError::NoInterpreter(path.display().to_string()))?;
            Ok(Launch::new(python).arg("-u").arg(path))
        }
        Some("sh") => Ok(Launch::new("sh").arg(path)),
        _ => Ok(Launch::new(path)),
    }
}

/// A program plus arguments, ready to become a `Command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    program: OsString,
    args: Vec<OsString>,
}

impl Launch {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Human-readable command line, for logs and the info endpoint.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub(crate) fn command(&self, cwd: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).current_dir(cwd);
        for (key, value) in ENV_OVERRIDES {
            command.env(key, value);
        }
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::write(root.join("hello.sh"), "echo hi\n").unwrap();
        fs::write(root.join("demo.py"), "print('hi')\n").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        (dir, root)
    }

    #[test]
    fn resolves_existing_file() {
        let (_dir, root) = root();
        assert_eq!(resolve_target(&root, "hello.sh").unwrap(), root.join("hello.sh"));
        assert_eq!(
            resolve_target(&root, "./sub/../hello.sh").unwrap(),
            root.join("hello.sh")
        );
    }

    #[test]
    fn rejects_empty_missing_outside_and_directories() {
        let (_dir, root) = root();
        assert!(matches!(resolve_target(&root, "  "), Err(StartError::EmptyTarget)));
        assert!(matches!(resolve_target(&root, "nope.py"), Err(StartError::Missing(_))));
        assert!(matches!(
            resolve_target(&root, "../../etc/passwd"),
            Err(StartError::OutsideRoot(_))
        ));
        assert!(matches!(
            resolve_target(&root, "../definitely-missing"),
            Err(StartError::OutsideRoot(_))
        ));
        assert!(matches!(resolve_target(&root, "sub"), Err(StartError::NotAFile(_))));
    }

    #[test]
    fn picks_interpreter_by_extension() {
        let (_dir, root) = root();
        let mut config = Config::for_root(&root).unwrap();
        config.interpreter = Some("python3".into());

        let launch = Target::Script(Some("demo.py".into())).launch(&config).unwrap();
        assert_eq!(
            launch.display(),
            format!("python3 -u {}", root.join("demo.py").display())
        );

        let launch = Target::Script(Some("hello.sh".into())).launch(&config).unwrap();
        assert_eq!(launch.display(), format!("sh {}", root.join("hello.sh").display()));

        config.interpreter = None;
        assert!(matches!(
            Target::Script(Some("demo.py".into())).launch(&config),
            Err(StartError::NoInterpreter(_))
        ));
    }

    #[test]
    fn missing_file_field_uses_default_script() {
        let (_dir, root) = root();
        let mut config = Config::for_root(&root).unwrap();
        assert!(matches!(
            Target::Script(None).launch(&config),
            Err(StartError::EmptyTarget)
        ));

        config.default_file = Some("hello.sh".into());
        let launch = Target::Script(None).launch(&config).unwrap();
        assert!(launch.display().ends_with("hello.sh"));
        // An explicit empty name is still an error.
        assert!(matches!(
            Target::Script(Some(String::new())).launch(&config),
            Err(StartError::EmptyTarget)
        ));
    }
}
