//! Owned argv/envp buffers handed to exec.
//!
//! Everything here is built before fork. The child only reads the prepared
//! pointer arrays, and the parent drops the whole plan when the invocation
//! scope ends.

use std::ffi::{CStr, CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use libc::c_char;

use crate::error::ProcpipeError;
use crate::Result;

/// Null-terminated string list plus the pointer array that references it.
#[derive(Debug)]
pub(crate) struct CStringArray {
    items: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl CStringArray {
    fn new(items: Vec<CString>) -> Self {
        let mut ptrs: Vec<*const c_char> = items.iter().map(|s| s.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        Self { items, ptrs }
    }

    /// Pointer suitable for `argv`/`envp`.
    pub(crate) fn as_ptr(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg(test)]
    fn get(&self, index: usize) -> Option<&CStr> {
        self.items.get(index).map(CString::as_c_str)
    }
}

/// Everything exec needs for one invocation.
#[derive(Debug)]
pub(crate) struct ExecPlan {
    /// Name as given, used for `execvp` and diagnostics.
    program: CString,
    /// Resolved path used with `execve`.
    path: CString,
    argv: CStringArray,
    envp: Option<CStringArray>,
}

impl ExecPlan {
    /// Marshal program, arguments and environment.
    ///
    /// An empty `envs` keeps the caller's environment and leaves PATH search
    /// to `execvp`. A non-empty `envs` replaces the environment and the
    /// program is resolved here, against the PATH it sets or else the
    /// caller's PATH.
    pub(crate) fn new(program: &str, args: &[String], envs: &[(String, String)]) -> Result<Self> {
        let program_c = to_cstring(program.as_bytes(), "program")?;

        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(program_c.clone());
        for (i, arg) in args.iter().enumerate() {
            argv.push(to_cstring(arg.as_bytes(), &format!("argument {}", i + 1))?);
        }

        let (path, envp) = if envs.is_empty() {
            (program_c.clone(), None)
        } else {
            let mut entries = Vec::with_capacity(envs.len());
            for (key, value) in envs {
                if key.is_empty() || key.contains('=') {
                    return Err(ProcpipeError::InvalidArgument(format!(
                        "invalid environment variable name '{}'",
                        key
                    )));
                }
                let entry = format!("{}={}", key, value);
                entries.push(to_cstring(entry.as_bytes(), "environment entry")?);
            }

            let search = envs
                .iter()
                .rev()
                .find(|(k, _)| k == "PATH")
                .map(|(_, v)| OsString::from(v))
                .or_else(|| std::env::var_os("PATH"));
            let resolved = resolve_program(program, search.as_deref());
            let path = to_cstring(resolved.as_os_str().as_bytes(), "program path")?;
            (path, Some(CStringArray::new(entries)))
        };

        Ok(Self {
            program: program_c,
            path,
            argv: CStringArray::new(argv),
            envp,
        })
    }

    pub(crate) fn program(&self) -> &CStr {
        &self.program
    }

    pub(crate) fn path(&self) -> &CStr {
        &self.path
    }

    pub(crate) fn argv(&self) -> &CStringArray {
        &self.argv
    }

    pub(crate) fn envp(&self) -> Option<&CStringArray> {
        self.envp.as_ref()
    }
}

fn to_cstring(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes)
        .map_err(|_| ProcpipeError::InvalidArgument(format!("{} contains a nul byte", what)))
}

/// Find `program` on `search`, the way `execvp` would.
///
/// Names containing `/` are used as given. When nothing matches, the bare
/// name is returned and exec reports the failure.
pub(crate) fn resolve_program(program: &str, search: Option<&OsStr>) -> PathBuf {
    if program.contains('/') || program.is_empty() {
        return PathBuf::from(program);
    }

    let search = search.unwrap_or_else(|| OsStr::new("/usr/bin:/bin"));
    for dir in std::env::split_paths(search) {
        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir
        };
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return candidate;
        }
    }
    PathBuf::from(program)
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_argv_starts_with_program() {
        let plan = ExecPlan::new("grep", &strings(&["-n", "", "hello"]), &[]).unwrap();
        assert_eq!(plan.argv().len(), 4);
        assert_eq!(plan.argv().get(0).unwrap().to_bytes(), b"grep");
        assert_eq!(plan.argv().get(2).unwrap().to_bytes(), b"");
        assert_eq!(plan.argv().get(3).unwrap().to_bytes(), b"hello");
        assert!(plan.envp().is_none());
        assert_eq!(plan.path().to_bytes(), b"grep");
    }

    #[test]
    fn test_pointer_array_is_null_terminated() {
        let plan = ExecPlan::new("echo", &strings(&["a"]), &[]).unwrap();
        let ptrs = plan.argv().as_ptr();
        unsafe {
            assert!(!(*ptrs).is_null());
            assert!(!(*ptrs.add(1)).is_null());
            assert!((*ptrs.add(2)).is_null());
        }
    }

    #[test]
    fn test_env_entries() {
        let envs = vec![
            ("FOO".to_string(), "bar".to_string()),
            ("EMPTY".to_string(), String::new()),
        ];
        let plan = ExecPlan::new("/bin/sh", &[], &envs).unwrap();
        let envp = plan.envp().unwrap();
        assert_eq!(envp.len(), 2);
        assert_eq!(envp.get(0).unwrap().to_bytes(), b"FOO=bar");
        assert_eq!(envp.get(1).unwrap().to_bytes(), b"EMPTY=");
        assert_eq!(plan.path().to_bytes(), b"/bin/sh");
    }

    #[test]
    fn test_nul_byte_rejected() {
        let err = ExecPlan::new("echo", &strings(&["ok", "bad\0arg"]), &[]).unwrap_err();
        assert!(err.to_string().contains("argument 2"));

        assert!(ExecPlan::new("ec\0ho", &[], &[]).is_err());
    }

    #[test]
    fn test_invalid_env_name_rejected() {
        let envs = vec![("A=B".to_string(), "c".to_string())];
        assert!(ExecPlan::new("env", &[], &envs).is_err());
    }

    #[test]
    fn test_resolve_with_slash_is_verbatim() {
        let path = resolve_program("./run.sh", Some(OsStr::new("/nowhere")));
        assert_eq!(path, PathBuf::from("./run.sh"));
    }

    #[test]
    fn test_resolve_finds_sh() {
        let path = resolve_program("sh", Some(OsStr::new("/nonexistent-dir:/bin:/usr/bin")));
        assert!(path.is_absolute());
        assert!(path.ends_with("sh"));
    }

    #[test]
    fn test_resolve_missing_returns_name() {
        let path = resolve_program("no_such_binary_xyz", Some(OsStr::new("/bin:/usr/bin")));
        assert_eq!(path, PathBuf::from("no_such_binary_xyz"));
    }

    #[test]
    fn test_env_path_used_for_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("procpipe-fixture");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let envs = vec![(
            "PATH".to_string(),
            dir.path().to_string_lossy().into_owned(),
        )];
        let plan = ExecPlan::new("procpipe-fixture", &[], &envs).unwrap();
        assert_eq!(plan.path().to_bytes(), script.as_os_str().as_bytes());
    }
}
