use crate::corpus::OutputLayout;
use crate::mutator::MutatorPreset;
use crate::scheduler::DEFAULT_MUTATION_BUDGET;
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Input directory ({0:?}) not found")]
    InputDirMissing(PathBuf),
    #[error("Input directory ({0:?}) is not a directory")]
    InputDirNotDir(PathBuf),
    #[error("Output directory ({0:?}) is not a directory")]
    OutputDirNotDir(PathBuf),
    #[error("Failed to prepare output directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invocation is empty")]
    EmptyInvocation,
    #[error("Failed to parse invocation '{invocation}': {reason}")]
    MalformedInvocation { invocation: String, reason: String },
    #[error("Invocation must start with an absolute or relative path, got '{0}'")]
    InvocationNotPath(String),
    #[error("Cannot expand '{0}': HOME is not set")]
    HomeUnset(String),
    #[error("Target binary not found (\"{given}\" -> {resolved:?})")]
    TargetNotFound { given: String, resolved: PathBuf },
    #[error("Mutation budget must be at least 1")]
    ZeroBudget,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    /// Target command line. `@@` is replaced by the path of the current input;
    /// without it the input is piped to stdin.
    pub invocation: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default)]
    pub stop_on_first_crash: bool,
    #[serde(default)]
    pub mutator: MutatorPreset,
    #[serde(default = "default_mutation_budget")]
    pub mutation_budget: usize,
    pub max_executions: Option<u64>,
    pub time_limit_secs: Option<u64>,
    pub seed: Option<u64>,
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

pub fn default_mutation_budget() -> usize {
    DEFAULT_MUTATION_BUDGET
}

pub fn default_stats_interval_ms() -> u64 {
    1000
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            stop_on_first_crash: false,
            mutator: MutatorPreset::default(),
            mutation_budget: default_mutation_budget(),
            max_executions: None,
            time_limit_secs: None,
            seed: None,
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TypistConfig {
    pub target: TargetSettings,
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    /// Directory relative target paths are resolved against. Set to the config
    /// file's directory when loaded from a file.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Everything a run needs, after validation and output preparation.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub input_dir: PathBuf,
    pub layout: OutputLayout,
    pub invocation: String,
    pub stop_on_first_crash: bool,
    pub mutator: MutatorPreset,
    pub mutation_budget: usize,
    pub max_executions: Option<u64>,
    pub time_limit: Option<Duration>,
    pub seed: Option<u64>,
    pub stats_interval: Duration,
}

impl TypistConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        config.base_dir = absolute.parent().map(Path::to_path_buf);
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Validates the configuration and lays out the output tree: a non-empty
    /// output directory is archived aside, then `queue/` and `crashes/` are
    /// created empty under a fresh one.
    pub fn prepare(&self) -> Result<RunSettings, ConfigError> {
        let input_dir = &self.corpus.input_dir;
        if !input_dir.exists() {
            return Err(ConfigError::InputDirMissing(input_dir.clone()));
        }
        if !input_dir.is_dir() {
            return Err(ConfigError::InputDirNotDir(input_dir.clone()));
        }
        if self.fuzzer.mutation_budget == 0 {
            return Err(ConfigError::ZeroBudget);
        }

        let invocation = self.canonical_invocation()?;
        let layout = prepare_output_dir(&self.corpus.output_dir)?;

        Ok(RunSettings {
            input_dir: input_dir.clone(),
            layout,
            invocation,
            stop_on_first_crash: self.fuzzer.stop_on_first_crash,
            mutator: self.fuzzer.mutator,
            mutation_budget: self.fuzzer.mutation_budget,
            max_executions: self.fuzzer.max_executions,
            time_limit: self.fuzzer.time_limit_secs.map(Duration::from_secs),
            seed: self.fuzzer.seed,
            stats_interval: Duration::from_millis(self.fuzzer.stats_interval_ms),
        })
    }

    /// Resolves the target binary to an absolute path. Accepted forms are
    /// absolute paths, `~/` paths and `.`-relative paths, the last resolved
    /// against `base_dir` (or the working directory).
    pub fn canonical_invocation(&self) -> Result<String, ConfigError> {
        let invocation = &self.target.invocation;
        let mut words =
            shell_words::split(invocation).map_err(|e| ConfigError::MalformedInvocation {
                invocation: invocation.clone(),
                reason: e.to_string(),
            })?;
        let binary = match words.first() {
            Some(binary) => binary.clone(),
            None => return Err(ConfigError::EmptyInvocation),
        };

        let resolved = if binary.starts_with('/') {
            PathBuf::from(&binary)
        } else if let Some(rest) = binary.strip_prefix("~/") {
            let home = std::env::var_os("HOME")
                .ok_or_else(|| ConfigError::HomeUnset(binary.clone()))?;
            PathBuf::from(home).join(rest)
        } else if binary.starts_with('.') {
            let base = match &self.base_dir {
                Some(dir) => dir.clone(),
                None => std::env::current_dir().map_err(|source| ConfigError::Read {
                    path: PathBuf::from("."),
                    source,
                })?,
            };
            base.join(&binary)
        } else {
            return Err(ConfigError::InvocationNotPath(binary));
        };

        if !resolved.exists() {
            return Err(ConfigError::TargetNotFound {
                given: binary,
                resolved,
            });
        }
        let resolved = fs::canonicalize(&resolved).unwrap_or(resolved);
        words[0] = resolved.to_string_lossy().into_owned();
        Ok(shell_words::join(words))
    }
}

/// Makes `output_dir` an empty directory holding empty `queue/` and `crashes/`
/// subdirectories, moving any previous non-empty contents to
/// `<name>-<YYYYmmdd-HHMM>` next to it.
pub fn prepare_output_dir(output_dir: &Path) -> Result<OutputLayout, ConfigError> {
    let io_err = |source| ConfigError::OutputDir {
        path: output_dir.to_path_buf(),
        source,
    };

    if output_dir.exists() {
        if !output_dir.is_dir() {
            return Err(ConfigError::OutputDirNotDir(output_dir.to_path_buf()));
        }
        let has_contents = fs::read_dir(output_dir).map_err(io_err)?.next().is_some();
        if has_contents {
            let archive_path = archive_path_for(output_dir).map_err(io_err)?;
            fs::rename(output_dir, &archive_path).map_err(io_err)?;
            info!(
                "Old output directory found at {}, moved to {}",
                output_dir.display(),
                archive_path.display()
            );
        }
    }
    fs::create_dir_all(output_dir).map_err(io_err)?;

    let layout = OutputLayout::under(output_dir);
    for dir in [&layout.crashes_dir, &layout.queue_dir] {
        fs::create_dir(dir).map_err(|source| ConfigError::OutputDir {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(layout)
}

fn archive_path_for(output_dir: &Path) -> std::io::Result<PathBuf> {
    let modified: DateTime<Local> = fs::metadata(output_dir)?.modified()?.into();
    let name = output_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let parent = output_dir.parent().unwrap_or_else(|| Path::new("."));
    let stem = format!("{name}-{}", modified.format("%Y%m%d-%H%M"));

    let mut candidate = parent.join(&stem);
    let mut suffix = 1;
    while candidate.exists() {
        candidate = parent.join(format!("{stem}-{suffix}"));
        suffix += 1;
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(root: &Path, invocation: &str) -> TypistConfig {
        TypistConfig {
            target: TargetSettings {
                invocation: invocation.to_string(),
            },
            corpus: CorpusSettings {
                input_dir: root.join("in"),
                output_dir: root.join("out"),
            },
            fuzzer: FuzzerSettings::default(),
            base_dir: Some(root.to_path_buf()),
        }
    }

    #[test]
    fn parses_minimal_toml_with_defaults() {
        let config = TypistConfig::from_toml_str(
            r#"
            [target]
            invocation = "./target @@"

            [corpus]
            input-dir = "seeds"
            output-dir = "out"
            "#,
        )
        .unwrap();
        assert_eq!(config.target.invocation, "./target @@");
        assert_eq!(config.corpus.input_dir, PathBuf::from("seeds"));
        assert!(!config.fuzzer.stop_on_first_crash);
        assert_eq!(config.fuzzer.mutator, MutatorPreset::BasicRandom);
        assert_eq!(config.fuzzer.mutation_budget, DEFAULT_MUTATION_BUDGET);
        assert_eq!(config.fuzzer.stats_interval_ms, 1000);
        assert!(config.fuzzer.seed.is_none());
    }

    #[test]
    fn parses_fuzzer_section() {
        let config = TypistConfig::from_toml_str(
            r#"
            [target]
            invocation = "/bin/cat"

            [corpus]
            input-dir = "seeds"
            output-dir = "out"

            [fuzzer]
            stop-on-first-crash = true
            mutator = "uppercase"
            max-executions = 1000
            time-limit-secs = 30
            seed = 27
            "#,
        )
        .unwrap();
        assert!(config.fuzzer.stop_on_first_crash);
        assert_eq!(config.fuzzer.mutator, MutatorPreset::Uppercase);
        assert_eq!(config.fuzzer.max_executions, Some(1000));
        assert_eq!(config.fuzzer.time_limit_secs, Some(30));
        assert_eq!(config.fuzzer.seed, Some(27));
    }

    #[test]
    fn rejects_unknown_fields_and_presets() {
        let unknown_field = r#"
            [target]
            invocation = "/bin/cat"
            timeout = 5

            [corpus]
            input-dir = "seeds"
            output-dir = "out"
        "#;
        assert!(TypistConfig::from_toml_str(unknown_field).is_err());

        let unknown_preset = r#"
            [target]
            invocation = "/bin/cat"

            [corpus]
            input-dir = "seeds"
            output-dir = "out"

            [fuzzer]
            mutator = "lowercase"
        "#;
        assert!(TypistConfig::from_toml_str(unknown_preset).is_err());
    }

    #[test]
    fn load_from_file_records_base_dir() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("typist.toml");
        fs::write(
            &path,
            concat!(
                "[target]\ninvocation = \"/bin/sh\"\n",
                "[corpus]\ninput-dir = \"in\"\noutput-dir = \"out\"\n",
            ),
        )
        .unwrap();
        let config = TypistConfig::load_from_file(&path).unwrap();
        assert_eq!(config.base_dir.as_deref(), Some(root.path()));

        let missing = TypistConfig::load_from_file(&root.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn missing_input_dir_is_reported_with_path() {
        let root = TempDir::new().unwrap();
        let config = config_for(root.path(), "/bin/sh");
        match config.prepare() {
            Err(ConfigError::InputDirMissing(path)) => assert_eq!(path, root.path().join("in")),
            other => panic!("Expected InputDirMissing, got {other:?}"),
        }

        fs::write(root.path().join("in"), b"not a dir").unwrap();
        assert!(matches!(
            config.prepare(),
            Err(ConfigError::InputDirNotDir(_))
        ));
    }

    #[test]
    fn prepare_creates_fresh_layout() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("in")).unwrap();
        let config = config_for(root.path(), "/bin/sh -c true");

        let settings = config.prepare().unwrap();
        assert!(settings.layout.queue_dir.is_dir());
        assert!(settings.layout.crashes_dir.is_dir());
        assert_eq!(settings.layout.root, root.path().join("out"));
        assert_eq!(settings.mutation_budget, DEFAULT_MUTATION_BUDGET);
        assert_eq!(settings.stats_interval, Duration::from_secs(1));
        assert!(settings.time_limit.is_none());
    }

    #[test]
    fn non_empty_output_dir_is_archived() {
        let root = TempDir::new().unwrap();
        let out = root.path().join("out");
        fs::create_dir_all(out.join("queue")).unwrap();
        fs::write(out.join("queue").join("id-0"), b"old").unwrap();

        let layout = prepare_output_dir(&out).unwrap();
        assert_eq!(fs::read_dir(&layout.queue_dir).unwrap().count(), 0);

        let archived: Vec<PathBuf> = fs::read_dir(root.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p != &out)
            .collect();
        assert_eq!(archived.len(), 1);
        let archive_name = archived[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(archive_name.starts_with("out-"), "archive named {archive_name}");
        assert_eq!(fs::read(archived[0].join("queue").join("id-0")).unwrap(), b"old");
    }

    #[test]
    fn repeated_archival_never_clobbers_previous_archive() {
        let root = TempDir::new().unwrap();
        let out = root.path().join("out");
        for _ in 0..3 {
            prepare_output_dir(&out).unwrap();
        }
        // Two archives from the second and third preparations plus the live dir.
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 3);
    }

    #[test]
    fn output_path_that_is_a_file_is_rejected() {
        let root = TempDir::new().unwrap();
        let out = root.path().join("out");
        fs::write(&out, b"").unwrap();
        assert!(matches!(
            prepare_output_dir(&out),
            Err(ConfigError::OutputDirNotDir(_))
        ));
    }

    #[test]
    fn relative_invocation_resolves_against_base_dir() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("target.sh"), b"exit 0\n").unwrap();
        let config = config_for(root.path(), "./target.sh --flag @@");

        let invocation = config.canonical_invocation().unwrap();
        let words = shell_words::split(&invocation).unwrap();
        let expected = fs::canonicalize(root.path().join("target.sh")).unwrap();
        assert_eq!(PathBuf::from(&words[0]), expected);
        assert_eq!(&words[1..], ["--flag", "@@"]);
    }

    #[test]
    fn invocation_errors_name_the_offending_value() {
        let root = TempDir::new().unwrap();

        match config_for(root.path(), "./missing_target").canonical_invocation() {
            Err(ConfigError::TargetNotFound { given, resolved }) => {
                assert_eq!(given, "./missing_target");
                assert_eq!(resolved, root.path().join("./missing_target"));
            }
            other => panic!("Expected TargetNotFound, got {other:?}"),
        }

        match config_for(root.path(), "target @@").canonical_invocation() {
            Err(ConfigError::InvocationNotPath(binary)) => assert_eq!(binary, "target"),
            other => panic!("Expected InvocationNotPath, got {other:?}"),
        }

        assert!(matches!(
            config_for(root.path(), "").canonical_invocation(),
            Err(ConfigError::EmptyInvocation)
        ));
    }

    #[test]
    fn zero_budget_is_rejected() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("in")).unwrap();
        let mut config = config_for(root.path(), "/bin/sh");
        config.fuzzer.mutation_budget = 0;
        assert!(matches!(config.prepare(), Err(ConfigError::ZeroBudget)));
    }
}
