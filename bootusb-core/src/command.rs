//! Typed invocations of external tools.
//!
//! Partitioning, formatting, mounting and bootloader installation are all
//! delegated to system tools. Instead of concatenating shell strings, each
//! invocation is a [`ToolCommand`]: a program plus an argument vector whose
//! path arguments are validated when they are added. The command is then
//! executed through a [`CommandRunner`], which tests replace with a recording
//! double.
use crate::error::{CommandError, ToolError};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::path::{Component, Path};
use std::process::{Command, Stdio};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
}

impl ToolCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    /// Appends a fixed argument (flags and literal values chosen by this crate).
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Appends a device node or partition path.
    pub fn path(mut self, path: &Path) -> Result<Self, CommandError> {
        validate_path(path)?;
        self.args.push(path.as_os_str().to_os_string());
        Ok(self)
    }

    /// Appends `--name=<path>` after validating the path.
    pub fn path_option(mut self, name: &str, path: &Path) -> Result<Self, CommandError> {
        validate_path(path)?;
        let mut arg = OsString::from(format!("--{name}="));
        arg.push(path.as_os_str());
        self.args.push(arg);
        Ok(self)
    }

    /// Appends a free-form value supplied by the user, such as a volume label.
    pub fn value(mut self, value: &str) -> Result<Self, CommandError> {
        if value.chars().any(char::is_control) {
            return Err(CommandError::InvalidArgument {
                arg: value.to_string(),
                reason: "contains control characters",
            });
        }
        self.args.push(OsString::from(value));
        Ok(self)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Rejects paths that could be misread by a tool or point somewhere unexpected.
pub fn validate_path(path: &Path) -> Result<(), CommandError> {
    let invalid = |reason| CommandError::InvalidPath {
        path: path.to_path_buf(),
        reason,
    };
    let raw = path.as_os_str();
    if raw.is_empty() {
        return Err(invalid("path is empty"));
    }
    if !path.is_absolute() {
        return Err(invalid("path must be absolute"));
    }
    if raw.to_string_lossy().chars().any(|c| c == '\0' || c.is_control()) {
        return Err(invalid("path contains control characters"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(invalid("path must not contain '..'"));
    }
    Ok(())
}

/// What a finished tool left behind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes tool invocations.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &ToolCommand) -> io::Result<ToolOutput>;
}

/// Runs tools as child processes of the current process.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &ToolCommand) -> io::Result<ToolOutput> {
        let output = command
            .to_command()
            .stdin(Stdio::null())
            .output()?;
        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs a command and turns a spawn failure or nonzero exit into a [`ToolError`].
pub fn run_checked(runner: &dyn CommandRunner, command: &ToolCommand) -> Result<ToolOutput, ToolError> {
    tracing::debug!("Running: {}", command);
    let output = runner.run(command).map_err(|source| ToolError::Spawn {
        program: command.program().to_string(),
        source,
    })?;

    if !output.success() {
        tracing::debug!(
            "{} failed with {:?}: {}",
            command.program(),
            output.exit_code,
            output.stderr.trim()
        );
        return Err(ToolError::Exit {
            program: command.program().to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr,
        });
    }
    Ok(output)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every invocation and answers from a script keyed on the program name.
    #[derive(Default)]
    pub struct FakeRunner {
        calls: Mutex<Vec<ToolCommand>>,
        responses: Mutex<Vec<(String, ToolOutput)>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// The next call to `program` returns `code` (and `stdout`).
        pub fn respond(&self, program: &str, code: i32, stdout: &str) {
            self.responses.lock().unwrap().push((
                program.to_string(),
                ToolOutput {
                    exit_code: Some(code),
                    stdout: stdout.to_string(),
                    stderr: if code == 0 { String::new() } else { format!("{program}: error") },
                },
            ));
        }

        pub fn calls(&self) -> Vec<ToolCommand> {
            self.calls.lock().unwrap().clone()
        }

        pub fn programs(&self) -> Vec<String> {
            self.calls().iter().map(|c| c.program().to_string()).collect()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, command: &ToolCommand) -> io::Result<ToolOutput> {
            self.calls.lock().unwrap().push(command.clone());
            let mut responses = self.responses.lock().unwrap();
            match responses.iter().position(|(p, _)| p == command.program()) {
                Some(index) => Ok(responses.remove(index).1),
                None => Ok(ToolOutput {
                    exit_code: Some(0),
                    ..ToolOutput::default()
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeRunner;
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn builds_argument_vector_without_a_shell() {
        let cmd = ToolCommand::new("mkfs.vfat")
            .arg("-F")
            .arg("32")
            .arg("-n")
            .value("MY USB")
            .unwrap()
            .path(Path::new("/dev/sdx1"))
            .unwrap();
        assert_eq!(cmd.program(), "mkfs.vfat");
        assert_eq!(cmd.args().len(), 5);
        assert_eq!(cmd.args()[3], OsString::from("MY USB"));
        assert_eq!(cmd.to_string(), "mkfs.vfat -F 32 -n MY USB /dev/sdx1");
    }

    #[test]
    fn rejects_relative_and_traversing_paths() {
        assert!(validate_path(Path::new("sdb")).is_err());
        assert!(validate_path(Path::new("-rf")).is_err());
        assert!(validate_path(Path::new("/dev/../etc/passwd")).is_err());
        assert!(validate_path(Path::new("")).is_err());
        assert!(validate_path(&PathBuf::from("/dev/sdb\n1")).is_err());
        assert!(validate_path(Path::new("/dev/disk/by-id/usb-Kingston_1-0:0")).is_ok());
    }

    #[test]
    fn path_option_joins_name_and_value() {
        let cmd = ToolCommand::new("grub-install")
            .path_option("boot-directory", Path::new("/tmp/mnt/boot"))
            .unwrap();
        assert_eq!(cmd.args()[0], OsString::from("--boot-directory=/tmp/mnt/boot"));
    }

    #[test]
    fn value_rejects_control_characters() {
        assert!(ToolCommand::new("mkfs.ext4").value("a\nb").is_err());
    }

    #[test]
    fn run_checked_keeps_exit_code() {
        let runner = FakeRunner::new();
        runner.respond("parted", 1, "");
        let err = run_checked(&runner, &ToolCommand::new("parted")).unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
        assert!(err.to_string().contains("exited with status 1"));
        assert!(run_checked(&runner, &ToolCommand::new("parted")).is_ok());
    }

    #[test]
    fn system_runner_reports_spawn_failure() {
        let cmd = ToolCommand::new("/nonexistent/bootusb-test-tool");
        let err = run_checked(&SystemRunner, &cmd).unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
        assert_eq!(err.exit_code(), None);
    }
}
