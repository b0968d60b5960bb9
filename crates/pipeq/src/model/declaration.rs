//! Data-driven pipeline declaration.
//!
//! A declaration file is a TOML document with `[[stage]]` tables. Jobs are declared either nested
//! in their stage as `[[stage.job]]`, or as top-level `[[job]]` tables naming their `stage`. It is
//! evaluated exactly once through [`ExperimentBuilder`] before anything is submitted.
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Map;
use crate::common::config::Config;
use crate::common::error::PipeqError;
use crate::model::{EnvMap, EnvValue, Executable, Experiment, Job, Stage, UsedPath};
use crate::rundir::name_code_for;

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct StageDef {
    pub name: String,
    pub queue: Option<String>,
    pub parallel_jobs: Option<u32>,
    pub batch_size: Option<u32>,
    pub mem_lo_gb: Option<f64>,
    pub mem_hi_gb: Option<f64>,
    #[serde(default)]
    pub source: Vec<String>,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub ld_library_path: Vec<String>,
    #[serde(default)]
    pub env: EnvMap,
    #[serde(default)]
    #[serde(rename = "job")]
    pub jobs: Vec<JobDef>,
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum JobNameDef {
    Text(String),
    Number(i64),
    Parts(Vec<JobNameDef>),
}

impl JobNameDef {
    fn render(&self) -> String {
        match self {
            JobNameDef::Text(text) => text.clone(),
            JobNameDef::Number(number) => number.to_string(),
            JobNameDef::Parts(parts) => parts
                .iter()
                .map(|part| part.render())
                .collect::<Vec<_>>()
                .join("_"),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobDef {
    pub stage: Option<String>,
    pub name: Option<JobNameDef>,
    pub command: Option<Vec<String>>,
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub switches: String,
    pub interpreter: Option<String>,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: EnvMap,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

impl JobDef {
    fn executable(&self, base: &Path) -> crate::Result<Executable> {
        match (&self.command, &self.script) {
            (Some(args), None) => {
                if args.is_empty() {
                    return Err(PipeqError::DeclarationError(
                        "Job command cannot be empty".to_string(),
                    ));
                }
                Ok(Executable::Command { args: args.clone() })
            }
            (None, Some(script)) => Ok(Executable::Script {
                interpreter: self
                    .interpreter
                    .clone()
                    .unwrap_or_else(|| "bash".to_string()),
                switches: self.switches.clone(),
                script: resolve(base, script),
                args: self.args.clone(),
            }),
            (Some(_), Some(_)) => Err(PipeqError::DeclarationError(
                "Attributes 'command' and 'script' cannot be mixed".to_string(),
            )),
            (None, None) => Err(PipeqError::DeclarationError(
                "One of attributes 'command' or 'script' has to be defined".to_string(),
            )),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct PipelineDef {
    pub name: Option<String>,
    #[serde(default)]
    #[serde(rename = "stage")]
    pub stages: Vec<StageDef>,
    #[serde(default)]
    #[serde(rename = "job")]
    pub jobs: Vec<JobDef>,
}

impl PipelineDef {
    pub fn parse(str: &str) -> crate::Result<PipelineDef> {
        let def: PipelineDef = toml::from_str(str)?;
        if def.jobs.is_empty() && def.stages.iter().all(|stage| stage.jobs.is_empty()) {
            return Err(PipeqError::DeserializationError("No jobs defined".into()));
        }
        Ok(def)
    }
}

/// Optional stage parameters, missing values are taken from [`Config`].
#[derive(Default, Debug, Clone)]
pub struct StageOptions {
    pub queue: Option<String>,
    pub parallel_jobs: Option<u32>,
    pub batch_size: Option<u32>,
    pub mem_lo_gb: Option<f64>,
    pub mem_hi_gb: Option<f64>,
    pub source: Vec<String>,
    pub path: Vec<String>,
    pub ld_library_path: Vec<String>,
    pub env: EnvMap,
}

pub struct ExperimentBuilder<'a> {
    config: &'a Config,
    experiment: Experiment,
}

impl<'a> ExperimentBuilder<'a> {
    pub fn new(config: &'a Config, name: String, name_code: String, declaration: PathBuf) -> Self {
        Self {
            config,
            experiment: Experiment {
                name,
                name_code,
                declaration,
                stages: vec![],
            },
        }
    }

    pub fn declare_stage(&mut self, name: &str, options: StageOptions) -> crate::Result<()> {
        if self.experiment.stage_index(name).is_some() {
            return Err(PipeqError::DeclarationError(format!(
                "Stage '{name}' is declared more than once"
            )));
        }
        let config = self.config;
        let parallel_jobs = options.parallel_jobs.unwrap_or(config.parallel_jobs);
        let batch_size = options.batch_size.unwrap_or(config.batch_size);
        if parallel_jobs == 0 || batch_size == 0 {
            return Err(PipeqError::DeclarationError(format!(
                "Stage '{name}' needs a positive parallel_jobs and batch_size"
            )));
        }

        let mut env: EnvMap = config
            .env
            .iter()
            .map(|(key, value)| (key.clone(), EnvValue::Text(value.clone())))
            .collect();
        env.extend(options.env);

        let source = if options.source.is_empty() {
            config.source.clone()
        } else {
            options.source
        };

        self.experiment.stages.push(Stage {
            name: name.to_string(),
            queue: options.queue.or_else(|| config.queue.clone()),
            parallel_jobs,
            batch_size,
            mem_lo_gb: options.mem_lo_gb.unwrap_or(config.mem_lo_gb),
            mem_hi_gb: options.mem_hi_gb.unwrap_or(config.mem_hi_gb),
            source,
            path: concat(&config.path, options.path),
            ld_library_path: concat(&config.ld_library_path, options.ld_library_path),
            env,
            jobs: vec![],
        });
        Ok(())
    }

    /// Adds a job to `stage`, to the last declared stage when `stage` is `None`.
    /// A stage that does not exist yet is declared with default parameters.
    pub fn declare_job(
        &mut self,
        executable: Executable,
        name: Option<String>,
        env: EnvMap,
        cwd: PathBuf,
        stage: Option<&str>,
        extra_paths: Vec<UsedPath>,
    ) -> crate::Result<()> {
        let stage_idx = match stage {
            Some(stage_name) => match self.experiment.stage_index(stage_name) {
                Some(idx) => idx,
                None => {
                    self.declare_stage(stage_name, StageOptions::default())?;
                    self.experiment.stages.len() - 1
                }
            },
            None => match self.experiment.stages.len() {
                0 => {
                    return Err(PipeqError::DeclarationError(
                        "Job declared before any stage".to_string(),
                    ));
                }
                count => count - 1,
            },
        };

        let stage = &mut self.experiment.stages[stage_idx];
        let name = name.unwrap_or_else(|| stage.jobs.len().to_string());
        if stage.jobs.iter().any(|job| job.name == name) {
            return Err(PipeqError::DeclarationError(format!(
                "Job '{}' is declared more than once in stage '{}'",
                name, stage.name
            )));
        }

        let mut job_env = stage.env.clone();
        job_env.extend(env);
        stage
            .jobs
            .push(Job::new(name, executable, job_env, cwd, extra_paths));
        Ok(())
    }

    pub fn finish(self) -> Experiment {
        self.experiment
    }
}

/// Builds an experiment from a parsed declaration.
/// Relative paths are resolved against the directory of `declaration`.
pub fn build_experiment(
    def: PipelineDef,
    declaration: &Path,
    config: &Config,
) -> crate::Result<Experiment> {
    let base = declaration
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = declaration
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = def.name.clone().unwrap_or_else(|| file_name.clone());

    let mut builder = ExperimentBuilder::new(
        config,
        name,
        name_code_for(declaration)?,
        declaration.to_path_buf(),
    );

    // A top-level job without `stage` is unambiguous only with a single declared stage
    let default_stage = match def.stages.as_slice() {
        [stage] => Some(stage.name.clone()),
        _ => None,
    };

    for stage in def.stages {
        let options = StageOptions {
            queue: stage.queue,
            parallel_jobs: stage.parallel_jobs,
            batch_size: stage.batch_size,
            mem_lo_gb: stage.mem_lo_gb,
            mem_hi_gb: stage.mem_hi_gb,
            source: stage
                .source
                .iter()
                .map(|source| resolve(&base, Path::new(source)).display().to_string())
                .collect(),
            path: stage.path,
            ld_library_path: stage.ld_library_path,
            env: resolve_env(&base, stage.env),
        };
        builder.declare_stage(&stage.name, options)?;
        for job in stage.jobs {
            if let Some(other) = &job.stage {
                return Err(PipeqError::DeclarationError(format!(
                    "Job nested in stage '{}' cannot name stage '{other}'",
                    stage.name
                )));
            }
            declare_job_def(&mut builder, &base, job, &stage.name)?;
        }
    }

    for mut job in def.jobs {
        let stage = match job.stage.take().or_else(|| default_stage.clone()) {
            Some(stage) => stage,
            None => {
                return Err(PipeqError::DeclarationError(
                    "Top-level job without 'stage' needs exactly one declared stage, \
                     nest it as [[stage.job]] or set its 'stage'"
                        .to_string(),
                ));
            }
        };
        declare_job_def(&mut builder, &base, job, &stage)?;
    }
    Ok(builder.finish())
}

fn declare_job_def(
    builder: &mut ExperimentBuilder<'_>,
    base: &Path,
    job: JobDef,
    stage: &str,
) -> crate::Result<()> {
    let executable = job.executable(base)?;
    let cwd = job
        .cwd
        .as_ref()
        .map(|cwd| resolve(base, cwd))
        .unwrap_or_else(|| base.to_path_buf());
    let extra_paths = job
        .paths
        .iter()
        .map(|path| UsedPath::new(resolve(base, path)))
        .collect();
    builder.declare_job(
        executable,
        job.name.as_ref().map(JobNameDef::render),
        resolve_env(base, job.env),
        cwd,
        Some(stage),
        extra_paths,
    )
}

/// Reads and evaluates a declaration file.
pub fn load_experiment(declaration: &Path, config: &Config) -> crate::Result<Experiment> {
    let declaration = std::path::absolute(declaration)?;
    let content = std::fs::read_to_string(&declaration).map_err(|error| {
        PipeqError::GenericError(format!(
            "Cannot read declaration {}: {error}",
            declaration.display()
        ))
    })?;
    let def = PipelineDef::parse(&content)?;
    build_experiment(def, &declaration, config)
}

fn concat(base: &[String], extra: Vec<String>) -> Vec<String> {
    let mut result = base.to_vec();
    result.extend(extra);
    result
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn resolve_env(base: &Path, env: EnvMap) -> EnvMap {
    env.into_iter()
        .map(|(key, value)| {
            let value = match value {
                EnvValue::Path(used) => EnvValue::Path(UsedPath {
                    path: resolve(base, &used.path),
                    mkdirs: used.mkdirs,
                }),
                text => text,
            };
            (key, value)
        })
        .collect::<Map<_, _>>()
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use crate::common::config::Config;
    use crate::common::error::PipeqError;
    use crate::model::declaration::{PipelineDef, build_experiment};
    use crate::model::{EnvValue, Executable, UsedPath};

    fn build(decl: &str) -> crate::Result<crate::model::Experiment> {
        let config = Config {
            path: vec!["/cfg/bin".to_string()],
            env: [("SHARED".to_string(), "cfg".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        build_experiment(
            PipelineDef::parse(decl)?,
            Path::new("/home/user/exp/pipeline.toml"),
            &config,
        )
    }

    #[test]
    fn test_minimal_declaration() {
        let exp = build(
            r#"
        [[stage]]
        name = "prep"

        [[job]]
        command = ["echo", "1"]

        [[job]]
        command = ["echo", "2"]
        "#,
        )
        .unwrap();
        assert_eq!(exp.name, "pipeline.toml");
        assert!(exp.name_code.starts_with("pipeline.toml_"));
        assert_eq!(exp.stages.len(), 1);
        let stage = &exp.stages[0];
        assert_eq!(stage.parallel_jobs, 4);
        assert_eq!(stage.batch_size, 1);
        assert_eq!(stage.path, vec!["/cfg/bin".to_string()]);
        let names: Vec<_> = stage.jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["0", "1"]);
        assert_eq!(stage.jobs[0].cwd, PathBuf::from("/home/user/exp"));
    }

    #[test]
    fn test_stage_overrides_and_job_env() {
        let exp = build(
            r#"
        name = "exp"

        [[stage]]
        name = "prep"
        parallel_jobs = 2
        batch_size = 3
        path = ["/opt/bin"]
        env = { SHARED = "stage", STAGE = "1" }

        [[job]]
        name = ["a", 1]
        script = "run.sh"
        args = "--fast"
        env = { STAGE = "job", OUT = { path = "out", mkdirs = true } }
        "#,
        )
        .unwrap();
        assert_eq!(exp.name, "exp");
        let stage = &exp.stages[0];
        assert_eq!(stage.parallel_jobs, 2);
        assert_eq!(stage.batch_size, 3);
        assert_eq!(
            stage.path,
            vec!["/cfg/bin".to_string(), "/opt/bin".to_string()]
        );

        let job = &stage.jobs[0];
        assert_eq!(job.name, "a_1");
        assert_eq!(job.env["SHARED"], EnvValue::Text("stage".to_string()));
        assert_eq!(job.env["STAGE"], EnvValue::Text("job".to_string()));
        assert_eq!(
            job.env["OUT"],
            EnvValue::Path(UsedPath {
                path: PathBuf::from("/home/user/exp/out"),
                mkdirs: true
            })
        );
        assert_eq!(
            job.executable,
            Executable::Script {
                interpreter: "bash".to_string(),
                switches: String::new(),
                script: PathBuf::from("/home/user/exp/run.sh"),
                args: "--fast".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_stage_is_created() {
        let exp = build(
            r#"
        [[stage]]
        name = "a"

        [[job]]
        command = ["true"]

        [[job]]
        stage = "b"
        command = ["true"]

        [[job]]
        command = ["false"]
        "#,
        )
        .unwrap();
        assert_eq!(exp.stages.len(), 2);
        assert_eq!(exp.stages[0].jobs.len(), 2);
        assert_eq!(exp.stages[1].name, "b");
        assert_eq!(exp.stages[1].jobs.len(), 1);
    }

    #[test]
    fn test_nested_jobs_keep_their_stage() {
        let exp = build(
            r#"
        [[stage]]
        name = "a"

        [[stage.job]]
        name = "first"
        command = ["true"]

        [[stage]]
        name = "b"

        [[stage.job]]
        name = "second"
        command = ["true"]

        [[job]]
        stage = "a"
        name = "third"
        command = ["true"]
        "#,
        )
        .unwrap();
        let names = |idx: usize| -> Vec<String> {
            exp.stages[idx].jobs.iter().map(|j| j.name.clone()).collect()
        };
        assert_eq!(exp.stages[0].name, "a");
        assert_eq!(names(0), vec!["first", "third"]);
        assert_eq!(exp.stages[1].name, "b");
        assert_eq!(names(1), vec!["second"]);
    }

    #[test]
    fn test_interleaved_jobs_without_stage() {
        let r = build(
            r#"
        [[stage]]
        name = "a"

        [[job]]
        name = "first"
        command = ["true"]

        [[stage]]
        name = "b"

        [[job]]
        name = "second"
        command = ["true"]
        "#,
        );
        assert!(matches!(r, Err(PipeqError::DeclarationError(_))));

        let r = build(
            r#"
        [[stage]]
        name = "a"

        [[stage.job]]
        stage = "b"
        command = ["true"]
        "#,
        );
        assert!(matches!(r, Err(PipeqError::DeclarationError(_))));
    }

    #[test]
    fn test_duplicate_names() {
        let r = build(
            r#"
        [[stage]]
        name = "a"
        [[stage]]
        name = "a"
        [[job]]
        command = ["true"]
        "#,
        );
        assert!(matches!(r, Err(PipeqError::DeclarationError(_))));

        let r = build(
            r#"
        [[stage]]
        name = "a"
        [[job]]
        name = "x"
        command = ["true"]
        [[job]]
        name = "x"
        command = ["true"]
        "#,
        );
        assert!(matches!(r, Err(PipeqError::DeclarationError(_))));
    }

    #[test]
    fn test_invalid_declarations() {
        let r = build(
            r#"
        [[job]]
        command = ["true"]
        "#,
        );
        assert!(matches!(r, Err(PipeqError::DeclarationError(_))));

        let r = build(
            r#"
        [[stage]]
        name = "a"
        batch_size = 0
        [[job]]
        command = ["true"]
        "#,
        );
        assert!(matches!(r, Err(PipeqError::DeclarationError(_))));

        let r = build(
            r#"
        [[stage]]
        name = "a"
        [[job]]
        command = ["true"]
        script = "x.sh"
        "#,
        );
        assert!(matches!(r, Err(PipeqError::DeclarationError(_))));
    }

    #[test]
    fn test_unknown_fields() {
        let r = PipelineDef::parse(
            r#"
        [[job]]
        command = ["true"]
        some_unknown_field = 1
        "#,
        );
        assert!(matches!(r, Err(PipeqError::DeserializationError(_))));
    }

    #[test]
    fn test_no_jobs() {
        let r = PipelineDef::parse(
            r#"
        [[stage]]
        name = "a"
        "#,
        );
        assert!(matches!(r, Err(PipeqError::DeserializationError(_))));
    }
}
