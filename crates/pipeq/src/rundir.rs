use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::common::error::PipeqError;
use crate::model::{Experiment, Stage};

pub const LOG_DIR: &str = "log";
pub const JOB_DIR: &str = "job";
pub const UNIT_DIR: &str = "sge";

/// Derives the run identifier of a declaration: its file name followed by the first three
/// uppercase hex characters of the BLAKE2b digest of its absolute path.
pub fn name_code_for(declaration: &Path) -> crate::Result<String> {
    let absolute = std::path::absolute(declaration)?;
    let digest = orion::hash::digest(absolute.as_os_str().as_encoded_bytes())
        .map_err(|error| PipeqError::GenericError(format!("Cannot hash path: {error}")))?;
    let hash = hex::encode_upper(digest.as_ref());
    let file_name = absolute
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(format!("{file_name}_{}", &hash[..3]))
}

/// Persisted layout of one experiment run.
///
/// ```text
/// <root>/<name_code>/log/<stage>/stdout_j000000.txt
///                   /job/<stage>/j000000.sh
///                   /sge/<stage>/s000000.sh
/// ```
#[derive(Clone, Debug)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    pub fn new(root: &Path, name_code: &str) -> Self {
        Self {
            path: root.join(name_code),
        }
    }

    pub fn for_experiment(root: &Path, experiment: &Experiment) -> Self {
        Self::new(root, &experiment.name_code)
    }

    pub fn directory(&self) -> &Path {
        &self.path
    }

    pub fn log_dir(&self, stage: &str) -> PathBuf {
        self.path.join(LOG_DIR).join(stage)
    }

    pub fn job_dir(&self, stage: &str) -> PathBuf {
        self.path.join(JOB_DIR).join(stage)
    }

    pub fn unit_dir(&self, stage: &str) -> PathBuf {
        self.path.join(UNIT_DIR).join(stage)
    }

    pub fn job_script(&self, stage: &str, job_idx: usize) -> PathBuf {
        self.job_dir(stage).join(format!("j{job_idx:06}.sh"))
    }

    pub fn unit_script(&self, stage: &str, unit_idx: usize) -> PathBuf {
        self.unit_dir(stage).join(format!("s{unit_idx:06}.sh"))
    }

    pub fn job_stdout(&self, stage: &str, job_idx: usize) -> PathBuf {
        self.log_dir(stage).join(format!("stdout_j{job_idx:06}.txt"))
    }

    pub fn job_stderr(&self, stage: &str, job_idx: usize) -> PathBuf {
        self.log_dir(stage).join(format!("stderr_j{job_idx:06}.txt"))
    }

    pub fn unit_stdout(&self, stage: &str, unit_idx: usize) -> PathBuf {
        self.log_dir(stage).join(format!("stdout_s{unit_idx:06}.txt"))
    }

    pub fn unit_stderr(&self, stage: &str, unit_idx: usize) -> PathBuf {
        self.log_dir(stage).join(format!("stderr_s{unit_idx:06}.txt"))
    }

    pub fn experiment_stdout(&self) -> PathBuf {
        self.path.join(LOG_DIR).join("stdout_experiment.txt")
    }

    pub fn experiment_stderr(&self) -> PathBuf {
        self.path.join(LOG_DIR).join("stderr_experiment.txt")
    }

    pub fn create_stage_dirs(&self, stage: &Stage) -> crate::Result<()> {
        for dir in [
            self.log_dir(&stage.name),
            self.job_dir(&stage.name),
            self.unit_dir(&stage.name),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Name of the scheduler unit running `unit_idx` of `stage`.
pub fn unit_name(name_code: &str, stage: &str, unit_idx: usize) -> String {
    format!("{name_code}_{stage}_{unit_idx}")
}

/// Prefix shared by the names of all units of an experiment.
pub fn unit_prefix(name_code: &str) -> String {
    format!("{name_code}_")
}

/// Reads a log file that may not exist yet.
///
/// Logs can be written on other nodes of a shared filesystem, so the file metadata is refreshed
/// before reading. A missing file reads as an empty string.
pub fn read_or_empty(path: &Path) -> crate::Result<String> {
    let mut file = match File::options().read(true).append(true).open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(_) => match File::open(path) {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(String::new());
            }
            Err(error) => return Err(error.into()),
        },
    };
    if let Err(error) = file.set_modified(SystemTime::now()) {
        log::trace!("Cannot refresh {}: {error}", path.display());
    }

    let mut buffer = vec![];
    file.read_to_end(&mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::rundir::{RunDir, name_code_for, read_or_empty, unit_name, unit_prefix};

    #[test]
    fn test_name_code() {
        let code = name_code_for(Path::new("/home/user/exp/pipeline.toml")).unwrap();
        let (name, hash) = code.rsplit_once('_').unwrap();
        assert_eq!(name, "pipeline.toml");
        assert_eq!(hash.len(), 3);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_eq!(
            code,
            name_code_for(Path::new("/home/user/exp/pipeline.toml")).unwrap()
        );
    }

    #[test]
    fn test_layout() {
        let dir = RunDir::new(Path::new("/tmp/root"), "exp_ABC");
        assert_eq!(
            dir.job_script("prep", 7),
            Path::new("/tmp/root/exp_ABC/job/prep/j000007.sh")
        );
        assert_eq!(
            dir.unit_script("prep", 12),
            Path::new("/tmp/root/exp_ABC/sge/prep/s000012.sh")
        );
        assert_eq!(
            dir.job_stderr("prep", 0),
            Path::new("/tmp/root/exp_ABC/log/prep/stderr_j000000.txt")
        );
        assert_eq!(
            dir.unit_stdout("prep", 1),
            Path::new("/tmp/root/exp_ABC/log/prep/stdout_s000001.txt")
        );
        assert_eq!(
            dir.experiment_stderr(),
            Path::new("/tmp/root/exp_ABC/log/stderr_experiment.txt")
        );
        assert_eq!(unit_name("exp_ABC", "prep", 3), "exp_ABC_prep_3");
        assert!(unit_name("exp_ABC", "prep", 3).starts_with(&unit_prefix("exp_ABC")));
    }

    #[test]
    fn test_read_missing_file() {
        let tmp = tempfile::TempDir::with_prefix("pipeq").unwrap();
        assert_eq!(read_or_empty(&tmp.path().join("missing.txt")).unwrap(), "");
        let path = tmp.path().join("log.txt");
        std::fs::write(&path, "hello\n").unwrap();
        assert_eq!(read_or_empty(&path).unwrap(), "hello\n");
    }
}
