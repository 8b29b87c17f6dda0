//! Runbook definition kinds and the interpreters that execute them.

use crate::error::{Result, WorkerError};

/// Definition kind codes used by the dispatch service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionKind {
    PowerShell,
    Python2,
    Python3,
    Bash,
}

impl DefinitionKind {
    pub fn code(&self) -> i32 {
        match self {
            Self::PowerShell => 5,
            Self::Python2 => 9,
            Self::Python3 => 10,
            Self::Bash => 11,
        }
    }
}

impl TryFrom<i32> for DefinitionKind {
    type Error = WorkerError;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            5 => Ok(Self::PowerShell),
            9 => Ok(Self::Python2),
            10 => Ok(Self::Python3),
            11 => Ok(Self::Bash),
            kind => Err(WorkerError::UnsupportedLanguage { kind }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub language: &'static str,
    pub command: String,
    pub arguments: Vec<String>,
}

impl Interpreter {
    pub fn new(language: &'static str, command: impl Into<String>, arguments: &[&str]) -> Self {
        Self {
            language,
            command: command.into(),
            arguments: arguments.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Language {
    pub extension: &'static str,
    pub interpreter: Interpreter,
}

impl Language {
    pub fn new(extension: &'static str, interpreter: Interpreter) -> Self {
        Self {
            extension,
            interpreter,
        }
    }

    pub fn for_kind(kind: DefinitionKind) -> Self {
        match kind {
            DefinitionKind::PowerShell => {
                let command = if cfg!(windows) { "powershell" } else { "pwsh" };
                Self::new("ps1", Interpreter::new("PowerShell", command, &["-File"]))
            }
            DefinitionKind::Python2 => {
                let command = if cfg!(windows) {
                    "C:\\python27\\python.exe"
                } else {
                    "python2"
                };
                Self::new("py", Interpreter::new("Python2", command, &[]))
            }
            DefinitionKind::Python3 => Self::new("py", Interpreter::new("Python3", "python3", &[])),
            DefinitionKind::Bash => Self::new("sh", Interpreter::new("Bash", "bash", &[])),
        }
    }

    /// Registry lookup by raw definition kind code.
    pub fn for_code(code: i32) -> Result<Self> {
        DefinitionKind::try_from(code).map(Self::for_kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_codes() {
        assert_eq!(Language::for_code(5).unwrap().extension, "ps1");
        assert_eq!(Language::for_code(9).unwrap().interpreter.language, "Python2");
        assert_eq!(Language::for_code(10).unwrap().interpreter.command, "python3");
        let bash = Language::for_code(11).unwrap();
        assert_eq!(bash.extension, "sh");
        assert_eq!(bash.interpreter.command, "bash");
        assert!(bash.interpreter.arguments.is_empty());
    }

    #[test]
    fn test_powershell_runs_script_file() {
        let ps = Language::for_kind(DefinitionKind::PowerShell);
        assert_eq!(ps.interpreter.arguments, vec!["-File".to_string()]);
    }

    #[test]
    fn test_unknown_kind_is_unsupported() {
        let err = Language::for_code(42).unwrap_err();
        assert!(matches!(err, WorkerError::UnsupportedLanguage { kind: 42 }));
        assert!(err.to_string().contains("unsupported language"));
    }

    #[test]
    fn test_code_roundtrip() {
        for kind in [
            DefinitionKind::PowerShell,
            DefinitionKind::Python2,
            DefinitionKind::Python3,
            DefinitionKind::Bash,
        ] {
            assert_eq!(DefinitionKind::try_from(kind.code()).unwrap(), kind);
        }
    }
}
