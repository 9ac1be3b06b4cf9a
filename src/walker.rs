//! Ignore-aware directory walking.
//!
//! Three independent toggles decide which ignore files apply:
//!
//! | Toggle | Source |
//! |--------|--------|
//! | `respect_gitignore` | `.gitignore` files and `.git/info/exclude` |
//! | `respect_index_ignore` | `.harnessignore` files |
//! | `respect_global_gitignore` | the user's global git excludes file |
//!
//! `ignore_files`, `exclude_globs` and `exclude_extensions` add to these.
//! Every source is OR-ed: a path matched by any of them is skipped.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::IndexingConfig;

pub const INDEX_IGNORE_FILE: &str = ".harnessignore";

/// Why a path was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    Extension,
    ExcludedGlob,
    IgnoreFile,
    OutsideRoot,
}

pub struct FileWalker {
    root: PathBuf,
    config: IndexingConfig,
    include: HashSet<String>,
    exclude: HashSet<String>,
    excluded_globs: GlobSet,
    /// Root-level ignore matchers, for checking single files outside a walk.
    matchers: Vec<Gitignore>,
}

impl FileWalker {
    /// `default_extensions` applies when `include_extensions` is empty,
    /// normally the extensions that have a registered parser.
    pub fn new(root: &Path, config: &IndexingConfig, default_extensions: &[String]) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", root.display()))?;

        let include_list = if config.include_extensions.is_empty() {
            default_extensions
        } else {
            &config.include_extensions
        };

        let mut builder = GlobSetBuilder::new();
        for pattern in &config.exclude_globs {
            builder.add(
                Glob::new(pattern).with_context(|| format!("Invalid exclude glob: {}", pattern))?,
            );
        }

        Ok(Self {
            matchers: build_matchers(&root, config),
            include: include_list.iter().map(|e| normalize_ext(e)).collect(),
            exclude: config.exclude_extensions.iter().map(|e| normalize_ext(e)).collect(),
            excluded_globs: builder.build()?,
            config: config.clone(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Project-relative path with `/` separators, used as the file's key.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
        )
    }

    /// Filters that need only the path itself.
    fn check_name(&self, rel: &str) -> Option<Skip> {
        let ext = Path::new(rel)
            .extension()
            .and_then(|e| e.to_str())
            .map(normalize_ext)
            .unwrap_or_default();
        if self.exclude.contains(&ext) || (!self.include.is_empty() && !self.include.contains(&ext)) {
            return Some(Skip::Extension);
        }
        if self.excluded_globs.is_match(rel) {
            return Some(Skip::ExcludedGlob);
        }
        None
    }

    /// Decide whether a single file would be skipped by a walk.
    ///
    /// Only root-level ignore files are consulted here; nested ignore files
    /// are honored by [`FileWalker::walk`].
    pub fn check(&self, path: &Path) -> Option<Skip> {
        let Some(rel) = self.relative(path) else {
            return Some(Skip::OutsideRoot);
        };
        if let Some(skip) = self.check_name(&rel) {
            return Some(skip);
        }
        let rel_path = Path::new(&rel);
        if self
            .matchers
            .iter()
            .any(|m| m.matched_path_or_any_parents(rel_path, false).is_ignore())
        {
            return Some(Skip::IgnoreFile);
        }
        None
    }

    /// All candidate files under the root, sorted.
    pub fn walk(&self) -> Vec<PathBuf> {
        self.walk_from(&self.root)
    }

    /// Candidate files under `start`, which must lie inside the root.
    /// Root-level ignore files still apply when `start` is a subdirectory.
    pub fn walk_from(&self, start: &Path) -> Vec<PathBuf> {
        let below_root = start != self.root;
        let mut builder = WalkBuilder::new(start);
        builder
            .hidden(true)
            .ignore(false)
            .parents(false)
            .require_git(false)
            .git_ignore(self.config.respect_gitignore)
            .git_exclude(self.config.respect_gitignore)
            .git_global(self.config.respect_global_gitignore)
            .follow_links(self.config.follow_symlinks);

        if self.config.respect_index_ignore {
            builder.add_custom_ignore_filename(INDEX_IGNORE_FILE);
        }
        for file in &self.config.ignore_files {
            let path = self.resolve(file);
            if let Some(err) = builder.add_ignore(&path) {
                warn!(path = %path.display(), error = %err, "failed to load ignore file");
            }
        }

        let mut files = Vec::new();
        for entry in builder.build() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            let Some(rel) = self.relative(path) else {
                continue;
            };
            if self.check_name(&rel).is_some() {
                continue;
            }
            if below_root
                && self
                    .matchers
                    .iter()
                    .any(|m| m.matched_path_or_any_parents(Path::new(&rel), false).is_ignore())
            {
                continue;
            }
            files.push(path.to_path_buf());
        }
        files.sort();
        files
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

fn build_matchers(root: &Path, config: &IndexingConfig) -> Vec<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    let mut sources = Vec::new();
    if config.respect_gitignore {
        sources.push(root.join(".gitignore"));
        sources.push(root.join(".git").join("info").join("exclude"));
    }
    if config.respect_index_ignore {
        sources.push(root.join(INDEX_IGNORE_FILE));
    }
    for file in &config.ignore_files {
        sources.push(if file.is_absolute() {
            file.clone()
        } else {
            root.join(file)
        });
    }
    for source in sources {
        if source.is_file() {
            if let Some(err) = builder.add(&source) {
                warn!(path = %source.display(), error = %err, "failed to load ignore file");
            }
        }
    }

    let mut matchers = Vec::new();
    match builder.build() {
        Ok(m) => matchers.push(m),
        Err(e) => warn!(error = %e, "failed to build ignore matcher"),
    }
    if config.respect_global_gitignore {
        let (global, err) = Gitignore::global();
        if let Some(err) = err {
            debug!(error = %err, "global gitignore not loaded");
        }
        matchers.push(global);
    }
    matchers
}

fn normalize_ext(ext: &str) -> String {
    ext.trim_start_matches('.').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn rels(walker: &FileWalker) -> Vec<String> {
        walker
            .walk()
            .iter()
            .map(|p| walker.relative(p).unwrap())
            .collect()
    }

    fn setup() -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "src/main.rs", "fn main() {}");
        write(root, "src/gen/out.rs", "fn gen() {}");
        write(root, "dist/bundle.js", "x");
        write(root, "vendor/lib.rs", "fn v() {}");
        write(root, "README.md", "# hi");
        write(root, ".gitignore", "dist/\n");
        write(root, ".harnessignore", "vendor/\n");
        tmp
    }

    #[test]
    fn test_toggles_and_globs_combine() {
        let tmp = setup();
        let exts = vec!["rs".to_string(), "js".to_string()];

        let mut config = IndexingConfig {
            exclude_globs: vec!["src/gen/**".into()],
            ..Default::default()
        };
        let walker = FileWalker::new(tmp.path(), &config, &exts).unwrap();
        assert_eq!(rels(&walker), vec!["src/main.rs"]);

        config.respect_gitignore = false;
        config.respect_index_ignore = false;
        config.exclude_globs.clear();
        let walker = FileWalker::new(tmp.path(), &config, &exts).unwrap();
        assert_eq!(
            rels(&walker),
            vec!["dist/bundle.js", "src/gen/out.rs", "src/main.rs", "vendor/lib.rs"]
        );
    }

    #[test]
    fn test_check_single_file() {
        let tmp = setup();
        let root = tmp.path().canonicalize().unwrap();
        let walker = FileWalker::new(&root, &IndexingConfig::default(), &["rs".to_string()]).unwrap();

        assert_eq!(walker.check(&root.join("src/main.rs")), None);
        assert_eq!(walker.check(&root.join("vendor/lib.rs")), Some(Skip::IgnoreFile));
        assert_eq!(walker.check(&root.join("README.md")), Some(Skip::Extension));
        assert_eq!(walker.check(Path::new("/elsewhere/x.rs")), Some(Skip::OutsideRoot));
    }

    #[test]
    fn test_walk_subdirectory_keeps_root_ignores() {
        let tmp = setup();
        write(tmp.path(), "vendor/inner/x.rs", "fn x() {}");
        let root = tmp.path().canonicalize().unwrap();
        let walker = FileWalker::new(&root, &IndexingConfig::default(), &["rs".to_string()]).unwrap();
        assert!(walker.walk_from(&root.join("vendor")).is_empty());
        assert_eq!(walker.walk_from(&root.join("src")).len(), 2);
    }

    #[test]
    fn test_extra_ignore_file() {
        let tmp = setup();
        write(tmp.path(), "extra.ignore", "src/\n");
        let config = IndexingConfig {
            ignore_files: vec![PathBuf::from("extra.ignore")],
            ..Default::default()
        };
        let walker = FileWalker::new(tmp.path(), &config, &["rs".to_string()]).unwrap();
        assert!(rels(&walker).is_empty());
    }
}
