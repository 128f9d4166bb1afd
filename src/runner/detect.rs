use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::errors::RunnerError;

use super::{RunKind, RunnerOption};

/// How to launch one runner: `program args... <file>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSpec {
    pub id: &'static str,
    pub label: &'static str,
    pub program: &'static str,
    pub args: &'static [&'static str],
}

impl RunnerSpec {
    const fn new(
        id: &'static str,
        label: &'static str,
        program: &'static str,
        args: &'static [&'static str],
    ) -> Self {
        Self {
            id,
            label,
            program,
            args,
        }
    }

    pub fn option(&self) -> RunnerOption {
        RunnerOption {
            id: self.id.to_string(),
            label: self.label.to_string(),
        }
    }
}

const BUN: RunnerSpec = RunnerSpec::new("bun", "Bun", "bun", &["run"]);
const TSX: RunnerSpec = RunnerSpec::new("tsx", "tsx", "tsx", &[]);
const DENO: RunnerSpec = RunnerSpec::new("deno", "Deno", "deno", &["run", "--allow-all"]);
const NODE: RunnerSpec = RunnerSpec::new("node", "Node.js", "node", &[]);
const PYTHON: RunnerSpec = RunnerSpec::new("python", "Python", "python3", &[]);
const BASH: RunnerSpec = RunnerSpec::new("bash", "Bash", "bash", &[]);

const BUN_TEST: RunnerSpec = RunnerSpec::new("bun-test", "bun test", "bun", &["test"]);
const VITEST: RunnerSpec = RunnerSpec::new("vitest", "Vitest", "npx", &["vitest", "run"]);
const NODE_TEST: RunnerSpec = RunnerSpec::new("node-test", "node --test", "node", &["--test"]);
const PYTEST: RunnerSpec = RunnerSpec::new("pytest", "pytest", "python3", &["-m", "pytest"]);

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

fn extension(path: &str) -> Option<&str> {
    Path::new(path).extension().and_then(|e| e.to_str())
}

/// Whether `path` looks like a test file by naming convention.
pub fn is_test_file(path: &str) -> bool {
    let name = file_name(path);
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    match extension(path) {
        Some("py") => stem.starts_with("test_") || stem.ends_with("_test"),
        Some("ts" | "tsx" | "mts" | "js" | "jsx" | "mjs" | "cjs") => {
            stem.ends_with(".test") || stem.ends_with(".spec")
        }
        _ => false,
    }
}

/// Every runner that could handle `path`, before availability checks.
pub fn candidates(kind: RunKind, path: &str) -> &'static [RunnerSpec] {
    match kind {
        RunKind::Script => match extension(path) {
            Some("ts" | "mts" | "tsx") => &[BUN, TSX, DENO],
            Some("js" | "mjs" | "cjs") => &[NODE, BUN],
            Some("py") => &[PYTHON],
            Some("sh" | "bash") => &[BASH],
            _ => &[],
        },
        RunKind::Test if !is_test_file(path) => &[],
        RunKind::Test => match extension(path) {
            Some("ts" | "mts" | "tsx") => &[BUN_TEST, VITEST],
            Some("js" | "mjs" | "cjs" | "jsx") => &[NODE_TEST, VITEST],
            Some("py") => &[PYTEST],
            _ => &[],
        },
    }
}

/// Search `PATH` for an executable named `program`.
pub fn is_on_path(program: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(program);
        candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
    })
}

type Availability = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Picks runners for a file from its extension, the programs installed and
/// the user's preferred runner per extension.
#[derive(Clone)]
pub struct RunnerDetector {
    preferred: HashMap<String, String>,
    available: Availability,
}

impl RunnerDetector {
    pub fn new(preferred: HashMap<String, String>) -> Self {
        Self {
            preferred,
            available: Arc::new(is_on_path),
        }
    }

    /// Replace the `PATH` lookup.
    pub fn with_availability(mut self, f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.available = Arc::new(f);
        self
    }

    fn installed(&self, kind: RunKind, path: &str) -> Vec<&'static RunnerSpec> {
        candidates(kind, path)
            .iter()
            .filter(|spec| (self.available)(spec.program))
            .collect()
    }

    /// Installed runners for `path`. A configured and installed preferred
    /// runner is returned alone.
    pub fn detect(&self, kind: RunKind, path: &str) -> Vec<RunnerOption> {
        let installed = self.installed(kind, path);
        let preferred = extension(path)
            .and_then(|ext| self.preferred.get(ext))
            .and_then(|id| installed.iter().find(|spec| spec.id == id.as_str()));
        match preferred {
            Some(spec) => vec![spec.option()],
            None => installed.iter().map(|spec| spec.option()).collect(),
        }
    }

    /// The runner to launch: the requested one, else the best detected one.
    pub fn resolve(
        &self,
        kind: RunKind,
        path: &str,
        runner_id: Option<&str>,
    ) -> Result<&'static RunnerSpec, RunnerError> {
        let installed = self.installed(kind, path);
        match runner_id {
            Some(id) => installed
                .into_iter()
                .find(|spec| spec.id == id)
                .ok_or_else(|| RunnerError::UnknownRunner {
                    runner_id: id.to_string(),
                    path: path.to_string(),
                }),
            None => {
                let first = self
                    .detect(kind, path)
                    .into_iter()
                    .next()
                    .ok_or_else(|| RunnerError::NoRunner {
                        path: path.to_string(),
                    })?;
                installed
                    .into_iter()
                    .find(|spec| spec.id == first.id)
                    .ok_or_else(|| RunnerError::NoRunner {
                        path: path.to_string(),
                    })
            }
        }
    }
}

impl Default for RunnerDetector {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}
