//! Artifact discovery and the ordered per-pass artifact mapping.
use crate::error::{CheckError, TestbedResult};
use crate::process::OutputMode;
use crate::testbed::{CommandKind, EnvOverrides, ExecRequest, Testbed};
use crate::util::{poll_until, sha256_hex};
use crate::variations::Role;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Files above this size are kept as a digest instead of their bytes.
pub const INLINE_LIMIT: u64 = 1024 * 1024;

const READ_RETRY: Duration = Duration::from_secs(2);

/// Lists regular files matching `$2` (unquoted, so the shell globs it)
/// relative to `$1`, NUL separated.
const LIST_SCRIPT: &str =
    "cd \"$1\" || exit 1; for f in $2; do if [ -f \"$f\" ]; then printf '%s\\0' \"$f\"; fi; done";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactContent {
    Inline(Vec<u8>),
    Digest(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub size: u64,
    pub sha256: String,
    pub content: ArtifactContent,
}

/// Artifacts of one pass keyed by relative path, in lexicographic order.
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    pub role: Role,
    pub root: PathBuf,
    pub entries: BTreeMap<String, Artifact>,
}

impl ArtifactSet {
    /// Whether both sets hold the same paths with the same bytes.
    pub fn same_content(&self, other: &ArtifactSet) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|((a_path, a), (b_path, b))| a_path == b_path && a.sha256 == b.sha256)
    }

    pub fn digests(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(path, artifact)| (path.clone(), artifact.sha256.clone()))
            .collect()
    }
}

/// Parse the NUL separated listing, dropping anything that could escape
/// the build directory. The result is sorted and deduplicated.
pub fn parse_listing(stdout: &[u8]) -> Vec<String> {
    let mut paths: Vec<String> = stdout
        .split(|&byte| byte == 0)
        .filter(|raw| !raw.is_empty())
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
        .map(|path| path.trim_start_matches("./").to_string())
        .filter(|path| is_safe_relative(path))
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

fn is_safe_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// Find, copy up and load the artifacts of a finished pass.
pub fn collect(
    testbed: &mut Testbed,
    role: Role,
    build_dir: &str,
    pattern: &str,
    store: &Path,
) -> Result<ArtifactSet, CheckError> {
    let relative = list_matches(testbed, build_dir, pattern)?;
    if relative.is_empty() {
        return Err(CheckError::ArtifactMissing {
            role,
            pattern: pattern.to_string(),
        });
    }
    let root = store.join(role.as_str());
    std::fs::create_dir_all(&root)
        .map_err(|err| CheckError::Config(format!("create {}: {err}", root.display())))?;
    for rel in &relative {
        let host = root.join(rel);
        testbed.copyup(
            &format!("{}/{rel}", build_dir.trim_end_matches('/')),
            &host.display().to_string(),
        )?;
    }
    tracing::info!(%role, count = relative.len(), "collected artifacts");
    load(role, &root, &relative).map_err(|err| {
        CheckError::Testbed(crate::error::TestbedError::Io(err))
    })
}

fn list_matches(testbed: &mut Testbed, build_dir: &str, pattern: &str) -> TestbedResult<Vec<String>> {
    let argv = vec![
        "sh".to_string(),
        "-c".to_string(),
        LIST_SCRIPT.to_string(),
        "sh".to_string(),
        build_dir.to_string(),
        pattern.to_string(),
    ];
    let env = EnvOverrides::new();
    let out = testbed.execute(&ExecRequest {
        argv: &argv,
        env: &env,
        cwd: None,
        stdin: None,
        kind: CommandKind::Short,
        output: OutputMode::Capture,
    })?;
    if out.exit_code != 0 {
        tracing::warn!(build_dir, status = out.exit_code, "listing artifacts failed");
        return Ok(Vec::new());
    }
    Ok(parse_listing(&out.stdout))
}

/// Read copied-up files into an ordered mapping.
pub fn load(role: Role, root: &Path, relative: &[String]) -> io::Result<ArtifactSet> {
    let mut entries = BTreeMap::new();
    for rel in relative {
        let bytes = read_with_retry(&root.join(rel))?;
        let size = bytes.len() as u64;
        let sha256 = sha256_hex(&bytes);
        let content = if size > INLINE_LIMIT {
            ArtifactContent::Digest(sha256.clone())
        } else {
            ArtifactContent::Inline(bytes)
        };
        entries.insert(
            rel.clone(),
            Artifact {
                size,
                sha256,
                content,
            },
        );
    }
    Ok(ArtifactSet {
        role,
        root: root.to_path_buf(),
        entries,
    })
}

/// Files written through a shared mount can lag briefly behind the guest.
fn read_with_retry(path: &Path) -> io::Result<Vec<u8>> {
    let mut last_error = None;
    let found = poll_until(READ_RETRY, || match std::fs::read(path) {
        Ok(bytes) => Ok::<_, io::Error>(Some(bytes)),
        Err(err) => {
            last_error = Some(err);
            Ok(None)
        }
    })?;
    match found {
        Some(bytes) => Ok(bytes),
        None => Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} never appeared", path.display()))
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_is_sorted_regardless_of_enumeration_order() {
        let listing = b"z.txt\0./a/b.bin\0m.txt\0a/b.bin\0\0";
        assert_eq!(parse_listing(listing), vec!["a/b.bin", "m.txt", "z.txt"]);
    }

    #[test]
    fn listing_rejects_escaping_paths() {
        let listing = b"../etc/passwd\0/abs\0ok\0a/../b\0";
        assert_eq!(parse_listing(listing), vec!["ok"]);
    }

    #[test]
    fn large_files_are_kept_as_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("small"), b"tiny").expect("write");
        std::fs::write(dir.path().join("big"), vec![7u8; INLINE_LIMIT as usize + 1]).expect("write");
        let set = load(
            Role::Control,
            dir.path(),
            &["big".to_string(), "small".to_string()],
        )
        .expect("load");
        assert_eq!(set.entries["small"].content, ArtifactContent::Inline(b"tiny".to_vec()));
        assert!(matches!(
            &set.entries["big"].content,
            ArtifactContent::Digest(digest) if digest.len() == 64
        ));
        let keys: Vec<&String> = set.entries.keys().collect();
        assert_eq!(keys, ["big", "small"]);
    }

    #[test]
    fn same_content_compares_paths_and_bytes() {
        let first = tempfile::tempdir().expect("tempdir");
        let second = tempfile::tempdir().expect("tempdir");
        std::fs::write(first.path().join("out"), b"same").expect("write");
        std::fs::write(second.path().join("out"), b"same").expect("write");
        let rel = vec!["out".to_string()];
        let a = load(Role::Control, first.path(), &rel).expect("load");
        let b = load(Role::Experiment, second.path(), &rel).expect("load");
        assert!(a.same_content(&b));
        std::fs::write(second.path().join("out"), b"diff").expect("write");
        let c = load(Role::Experiment, second.path(), &rel).expect("load");
        assert!(!a.same_content(&c));
    }
}
