//! Artifact collection
//!
//! After the phases reach a terminal state, the container working directory is
//! copied out once as a tar stream. Each [`ArtifactRule`] then selects the
//! entries whose path, relative to the rule's base directory, matches its glob
//! and writes them under the rule's local destination.
//!
//! Glob syntax: `*` matches within one path segment, `?` matches one
//! character, `**` matches any number of segments (including none). A pattern
//! ending in `/` selects everything below that directory.
//!
//! Collection failures are reported as [`ArtifactError`]s next to the run
//! result; they never change the run outcome.

use crate::buildspec::ArtifactGroup;
use crate::errors::ArtifactError;
use crate::runtime::ContainerRuntime;
use crate::session::{ContainerSession, SessionManager};
use bytesize::ByteSize;
use regex::Regex;
use serde::Serialize;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Compiled artifact glob
#[derive(Debug, Clone)]
pub struct GlobPattern {
    raw: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let normalized = if pattern.ends_with('/') {
            format!("{}**", pattern)
        } else {
            pattern.trim_start_matches("./").to_string()
        };
        Ok(Self {
            raw: pattern.to_string(),
            regex: Regex::new(&glob_to_regex(&normalized))?,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    regex.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    regex.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                regex.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                regex.push_str("[^/]");
                i += 1;
            }
            c => {
                regex.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }

    regex.push('$');
    regex
}

/// One pattern and where its matches go
#[derive(Debug, Clone)]
pub struct ArtifactRule {
    pub pattern: GlobPattern,
    /// Directory (relative to the working directory) the pattern applies to
    pub base_directory: Option<String>,
    pub destination: PathBuf,
    pub discard_paths: bool,
    /// Secondary artifact identifier, `None` for the primary group
    pub group: Option<String>,
}

impl ArtifactRule {
    /// Rules for the declared artifact groups
    ///
    /// The primary group writes to `artifacts_dir`, secondary group `<id>` to
    /// `artifacts_dir/<id>`.
    pub fn from_groups(
        groups: &[ArtifactGroup],
        artifacts_dir: &Path,
    ) -> Result<Vec<Self>, ArtifactError> {
        let mut rules = Vec::new();
        for group in groups {
            let destination = match &group.identifier {
                Some(id) => artifacts_dir.join(id),
                None => artifacts_dir.to_path_buf(),
            };
            for pattern in &group.files {
                let pattern = GlobPattern::new(pattern).map_err(|e| ArtifactError::NoMatch {
                    pattern: pattern.clone(),
                    base: format!("invalid pattern: {}", e),
                })?;
                rules.push(Self {
                    pattern,
                    base_directory: group.base_directory.clone(),
                    destination: destination.clone(),
                    discard_paths: group.discard_paths,
                    group: group.identifier.clone(),
                });
            }
        }
        Ok(rules)
    }

    /// Local destination of `path`, if this rule selects it
    fn target(&self, path: &str) -> Option<PathBuf> {
        let relative = self.relative(path)?;
        if !self.pattern.matches(relative) {
            return None;
        }
        Some(if self.discard_paths {
            let name = relative.rsplit('/').next().unwrap_or(relative);
            self.destination.join(name)
        } else {
            self.destination.join(relative)
        })
    }

    /// Path relative to the base directory, if `path` lies inside it
    fn relative<'p>(&self, path: &'p str) -> Option<&'p str> {
        match &self.base_directory {
            None => Some(path),
            Some(base) if base.is_empty() || base == "." => Some(path),
            Some(base) => path
                .strip_prefix(base.as_str())
                .and_then(|rest| rest.strip_prefix('/')),
        }
    }
}

/// One file written to a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectedFile {
    pub group: Option<String>,
    pub source: String,
    pub destination: PathBuf,
    pub size: u64,
}

/// Outcome of artifact collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactReport {
    pub collected: Vec<CollectedFile>,
    pub errors: Vec<ArtifactError>,
}

impl ArtifactReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn total_size(&self) -> ByteSize {
        ByteSize::b(self.collected.iter().map(|f| f.size).sum())
    }
}

/// Copies declared artifacts out of the session
#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    rules: Vec<ArtifactRule>,
}

impl ArtifactCollector {
    pub fn new(rules: Vec<ArtifactRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Copy the working directory out once and apply every rule
    #[instrument(skip_all, fields(rules = self.rules.len()))]
    pub async fn collect<R: ContainerRuntime>(
        &self,
        sessions: &SessionManager<R>,
        session: &ContainerSession,
    ) -> ArtifactReport {
        if self.rules.is_empty() {
            debug!("No artifacts declared");
            return ArtifactReport::default();
        }

        let archive_failure = |reason: String| ArtifactReport {
            collected: Vec::new(),
            errors: vec![ArtifactError::Archive { reason }],
        };

        let archive = match sessions.copy_out(session, session.working_dir()).await {
            Ok(archive) => archive,
            Err(e) => return archive_failure(e.to_string()),
        };

        let collector = self.clone();
        match tokio::task::spawn_blocking(move || collector.extract(archive)).await {
            Ok(report) => report,
            Err(e) => archive_failure(e.to_string()),
        }
    }

    /// Write the entries of a `docker cp` tar stream that the rules select
    ///
    /// Entries are matched by path before their contents are read; unmatched
    /// entries are skipped in the stream. The first path component (the copied
    /// directory's own name) is stripped and entries escaping the directory
    /// are ignored. A broken stream keeps what was written before it broke.
    pub fn extract<A: Read>(&self, archive: A) -> ArtifactReport {
        let mut report = ArtifactReport::default();
        let mut matched = vec![0usize; self.rules.len()];

        let mut archive = tar::Archive::new(archive);
        if let Err(e) = self.extract_entries(&mut archive, &mut matched, &mut report) {
            report.errors.push(ArtifactError::Archive {
                reason: e.to_string(),
            });
            return report;
        }
        // Read to the end so the copy's exit status is checked
        if let Err(e) = std::io::copy(&mut archive.into_inner(), &mut std::io::sink()) {
            report.errors.push(ArtifactError::Archive {
                reason: e.to_string(),
            });
            return report;
        }

        for (rule, count) in self.rules.iter().zip(matched) {
            if count == 0 {
                report.errors.push(ArtifactError::NoMatch {
                    pattern: rule.pattern.as_str().to_string(),
                    base: rule
                        .base_directory
                        .clone()
                        .unwrap_or_else(|| ".".to_string()),
                });
            }
        }

        info!(
            "Collected {} artifact files ({}) with {} errors",
            report.collected.len(),
            report.total_size(),
            report.errors.len()
        );
        report
    }

    fn extract_entries<A: Read>(
        &self,
        archive: &mut tar::Archive<A>,
        matched: &mut [usize],
        report: &mut ArtifactReport,
    ) -> std::io::Result<()> {
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let raw_path = entry.path()?.into_owned();
            let Some(path) = working_dir_path(&raw_path) else {
                debug!("Skipping archive entry {}", raw_path.display());
                continue;
            };

            let targets: Vec<(usize, PathBuf)> = self
                .rules
                .iter()
                .enumerate()
                .filter_map(|(index, rule)| rule.target(&path).map(|target| (index, target)))
                .collect();
            if targets.is_empty() {
                continue;
            }

            let mode = entry.header().mode().unwrap_or(0o644);
            // The entry is read once; later targets copy the first written file
            let mut written: Option<PathBuf> = None;
            let mut unreadable: Option<String> = None;
            for (index, target) in targets {
                matched[index] += 1;
                let rule = &self.rules[index];

                let result = if let Some(first) = &written {
                    copy_file(first, &target, mode)
                } else if let Some(reason) = &unreadable {
                    Err(std::io::Error::other(reason.clone()))
                } else {
                    let result = write_entry(&mut entry, &target, mode);
                    if let Err(e) = &result {
                        unreadable = Some(e.to_string());
                    }
                    result
                };

                match result {
                    Ok(size) => {
                        if written.is_none() {
                            written = Some(target.clone());
                        }
                        report.collected.push(CollectedFile {
                            group: rule.group.clone(),
                            source: path.clone(),
                            destination: target,
                            size,
                        });
                    }
                    Err(e) => {
                        warn!("Failed to write artifact {}: {}", target.display(), e);
                        report.errors.push(ArtifactError::Destination {
                            destination: target.display().to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Path of an archive entry relative to the copied directory, `/`-separated
fn working_dir_path(path: &Path) -> Option<String> {
    let mut components = Vec::new();
    for component in path.components().skip(1) {
        match component {
            Component::Normal(part) => components.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if components.is_empty() {
        None
    } else {
        Some(components.join("/"))
    }
}

fn create_parent(target: &Path) -> std::io::Result<()> {
    match target.parent() {
        Some(parent) => std::fs::create_dir_all(parent),
        None => Ok(()),
    }
}

fn set_mode(target: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode & 0o777))?;
    }
    #[cfg(not(unix))]
    let _ = (target, mode);
    Ok(())
}

fn write_entry(entry: &mut impl Read, target: &Path, mode: u32) -> std::io::Result<u64> {
    create_parent(target)?;
    let mut file = std::fs::File::create(target)?;
    let size = std::io::copy(entry, &mut file)?;
    set_mode(target, mode)?;
    Ok(size)
}

fn copy_file(source: &Path, target: &Path, mode: u32) -> std::io::Result<u64> {
    create_parent(target)?;
    let size = std::fs::copy(source, target)?;
    set_mode(target, mode)?;
    Ok(size)
}
