use super::language::{DefinitionKind, Language};

/// Script a job executes, plus the file name it is persisted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runbook {
    pub name: String,
    pub version_id: String,
    pub kind: DefinitionKind,
    pub definition: String,
    /// `<name>-<versionId>.<ext>`; distinct versions never share a file.
    pub file_name: String,
}

impl Runbook {
    pub fn new(
        name: impl Into<String>,
        version_id: impl Into<String>,
        kind: DefinitionKind,
        definition: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let version_id = version_id.into();
        let extension = Language::for_kind(kind).extension;
        let file_name = format!(
            "{}-{}.{}",
            path_safe(&name),
            path_safe(&version_id),
            extension
        );
        Self {
            name,
            version_id,
            kind,
            definition: definition.into(),
            file_name,
        }
    }
}

/// Names come from the service; keep them to a single path component.
fn path_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_is_deterministic() {
        let a = Runbook::new("cleanup", "42", DefinitionKind::Python3, "print(1)");
        let b = Runbook::new("cleanup", "42", DefinitionKind::Python3, "print(2)");
        let c = Runbook::new("cleanup", "43", DefinitionKind::Python3, "print(1)");
        assert_eq!(a.file_name, "cleanup-42.py");
        assert_eq!(a.file_name, b.file_name);
        assert_ne!(a.file_name, c.file_name);
    }

    #[test]
    fn test_separators_never_leave_job_directory() {
        let runbook = Runbook::new("../../etc/cron.d/evil", "v/1", DefinitionKind::Bash, "");
        assert_eq!(runbook.file_name, ".._.._etc_cron.d_evil-v_1.sh");

        let dir = std::path::Path::new("/work/job-1");
        let path = dir.join(&runbook.file_name);
        assert_eq!(path.parent(), Some(dir));

        let windows = Runbook::new("a\\b", "1", DefinitionKind::PowerShell, "");
        assert_eq!(windows.file_name, "a_b-1.ps1");
    }

    #[test]
    fn test_extension_follows_kind() {
        assert!(Runbook::new("r", "1", DefinitionKind::Bash, "").file_name.ends_with(".sh"));
        assert!(Runbook::new("r", "1", DefinitionKind::PowerShell, "").file_name.ends_with(".ps1"));
    }
}
