use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::{Error, Result};

/// Where one of the child's standard streams goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdio {
    /// Share the parent's descriptor.
    Inherit,
    /// `/dev/null`.
    Null,
    /// Redirect to a descriptor the caller owns.
    Fd(RawFd),
    /// A pipe owned by the supervisor. Output is handed to the output
    /// callback, input comes from `Command::input`.
    Piped,
    /// stderr only: share whatever stdout ends up being.
    JoinStdout,
}

/// The standard stream a chunk of output (or input) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

// -----------------------------------------------------------------------------
//     - Command -
// -----------------------------------------------------------------------------
/// Everything needed to start one child: program, arguments, environment
/// overrides, stdio plan and an optional deadline.
#[derive(Debug, Clone)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    clear_env: bool,
    pub(crate) stdin: Stdio,
    pub(crate) stdout: Stdio,
    pub(crate) stderr: Stdio,
    pub(crate) input: Option<Vec<u8>>,
    pub(crate) deadline: Option<Duration>,
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            env: Vec::new(),
            clear_env: false,
            stdin: Stdio::Inherit,
            stdout: Stdio::Inherit,
            stderr: Stdio::Inherit,
            input: None,
            deadline: None,
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// Override one variable. Overrides apply in order, later ones win.
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, val: V) -> Self {
        self.env.push((key.as_ref().to_owned(), val.as_ref().to_owned()));
        self
    }

    /// Start the child from an empty environment instead of the parent's.
    pub fn env_clear(mut self) -> Self {
        self.clear_env = true;
        self
    }

    pub fn stdin(mut self, stdio: Stdio) -> Self {
        self.stdin = stdio;
        self
    }

    pub fn stdout(mut self, stdio: Stdio) -> Self {
        self.stdout = stdio;
        self
    }

    pub fn stderr(mut self, stdio: Stdio) -> Self {
        self.stderr = stdio;
        self
    }

    /// Bytes fed to a piped stdin; the pipe is closed once they are written.
    pub fn input<B: Into<Vec<u8>>>(mut self, bytes: B) -> Self {
        self.input = Some(bytes.into());
        self
    }

    /// Kill the child if it is still running this long after it started.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            return Err(Error::InvalidCommand("empty program".into()));
        }

        if self.stdin == Stdio::JoinStdout || self.stdout == Stdio::JoinStdout {
            return Err(Error::InvalidCommand("only stderr can join stdout".into()));
        }

        if self.input.is_some() && self.stdin != Stdio::Piped {
            return Err(Error::InvalidCommand("input requires a piped stdin".into()));
        }

        for stdio in &[self.stdin, self.stdout, self.stderr] {
            if let Stdio::Fd(fd) = stdio {
                if *fd < 0 {
                    return Err(Error::InvalidDescriptor(*fd));
                }
            }
        }

        for (key, _) in &self.env {
            if key.is_empty() || key.as_bytes().contains(&b'=') {
                return Err(Error::InvalidCommand(format!("bad environment key {:?}", key)));
            }
        }

        Ok(())
    }

    /// argv, program first.
    pub(crate) fn argv(&self) -> Result<Vec<CString>> {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| to_cstring(a.clone()))
            .collect()
    }

    /// The full `KEY=VALUE` environment of the child.
    pub(crate) fn envp(&self) -> Result<Vec<CString>> {
        let mut vars: BTreeMap<OsString, OsString> = match self.clear_env {
            true => BTreeMap::new(),
            false => std::env::vars_os().collect(),
        };

        for (key, val) in &self.env {
            vars.insert(key.clone(), val.clone());
        }

        vars.into_iter()
            .map(|(key, val)| {
                let mut pair = key.into_vec();
                pair.push(b'=');
                pair.extend_from_slice(val.as_bytes());
                to_cstring(OsString::from_vec(pair))
            })
            .collect()
    }
}

fn to_cstring(s: OsString) -> Result<CString> {
    CString::new(s.into_vec()).map_err(|_| Error::InvalidCommand("interior nul byte".into()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn join_stdout_is_stderr_only() {
        let cmd = Command::new("true").stdout(Stdio::JoinStdout);
        assert!(cmd.validate().is_err());
        let cmd = Command::new("true").stderr(Stdio::JoinStdout);
        assert!(cmd.validate().is_ok());
    }

    #[test]
    fn input_needs_a_pipe() {
        let cmd = Command::new("cat").input("hi");
        assert!(cmd.validate().is_err());
        let cmd = Command::new("cat").stdin(Stdio::Piped).input("hi");
        assert!(cmd.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply_in_order() {
        let cmd = Command::new("env").env_clear().env("A", "1").env("B", "2").env("A", "3");
        let envp: Vec<String> = cmd
            .envp()
            .unwrap()
            .into_iter()
            .map(|c| c.into_string().unwrap())
            .collect();
        assert_eq!(envp, vec!["A=3", "B=2"]);
    }

    #[test]
    fn bad_env_key() {
        let cmd = Command::new("env").env("A=B", "1");
        match cmd.validate() {
            Err(Error::InvalidCommand(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn argv_starts_with_program() {
        let argv = Command::new("sh").args(&["-c", "exit 7"]).argv().unwrap();
        let argv: Vec<&str> = argv.iter().map(|c| c.to_str().unwrap()).collect();
        assert_eq!(argv, vec!["sh", "-c", "exit 7"]);
    }

    #[test]
    fn nul_in_args_is_rejected() {
        assert!(Command::new("sh").arg("a\0b").argv().is_err());
    }
}
