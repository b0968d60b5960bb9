use std::cell::RefCell;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use derive_builder::Builder;

use crate::model::{EnvMap, Executable, Experiment, Job, Stage, UsedPath};
use crate::scheduler::{ActiveUnit, SchedulerAdapter, SchedulerFuture, UnitId, UnitState};

#[derive(Builder)]
#[builder(name = "JobBuilder", pattern = "owned", build_fn(name = "finish"))]
pub struct TestJob {
    #[builder(setter(into), default = "\"job\".to_string()")]
    name: String,
    #[builder(default = "Executable::Command { args: vec![\"true\".to_string()] }")]
    executable: Executable,
    #[builder(default)]
    env: EnvMap,
    #[builder(setter(into), default = "PathBuf::from(\"/work\")")]
    cwd: PathBuf,
    #[builder(default)]
    extra_paths: Vec<UsedPath>,
}

impl JobBuilder {
    pub fn build(self) -> Job {
        let TestJob {
            name,
            executable,
            env,
            cwd,
            extra_paths,
        } = self.finish().unwrap();
        Job::new(name, executable, env, cwd, extra_paths)
    }
}

#[derive(Builder)]
#[builder(name = "StageBuilder", pattern = "owned", build_fn(name = "finish"))]
pub struct TestStage {
    #[builder(setter(into), default = "\"stage\".to_string()")]
    name: String,
    /// Number of jobs, named by their index.
    #[builder(default = "1")]
    jobs: usize,
    #[builder(default)]
    queue: Option<String>,
    #[builder(default = "4")]
    parallel_jobs: u32,
    #[builder(default = "1")]
    batch_size: u32,
    #[builder(default = "10.0")]
    mem_lo_gb: f64,
    #[builder(default = "64.0")]
    mem_hi_gb: f64,
    #[builder(default)]
    source: Vec<String>,
    #[builder(default)]
    path: Vec<String>,
    #[builder(default)]
    ld_library_path: Vec<String>,
}

impl StageBuilder {
    pub fn build(self) -> Stage {
        let TestStage {
            name,
            jobs,
            queue,
            parallel_jobs,
            batch_size,
            mem_lo_gb,
            mem_hi_gb,
            source,
            path,
            ld_library_path,
        } = self.finish().unwrap();
        Stage {
            name,
            queue,
            parallel_jobs,
            batch_size,
            mem_lo_gb,
            mem_hi_gb,
            source,
            path,
            ld_library_path,
            env: Default::default(),
            jobs: (0..jobs)
                .map(|idx| JobBuilder::default().name(idx.to_string()).build())
                .collect(),
        }
    }
}

pub fn experiment(stages: Vec<StageBuilder>) -> Experiment {
    Experiment {
        name: "pipeline.toml".to_string(),
        name_code: "exp_ABC".to_string(),
        declaration: PathBuf::from("/work/pipeline.toml"),
        stages: stages.into_iter().map(|stage| stage.build()).collect(),
    }
}

/// In-memory writer whose content can be inspected while it is owned elsewhere.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    data: Rc<RefCell<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

type UnitCallback = Box<dyn FnMut(&str)>;

struct MockUnit {
    id: UnitId,
    name: String,
    state: UnitState,
    /// Number of remaining listings before the unit disappears, `None` means forever.
    remaining: Option<usize>,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    units: Vec<MockUnit>,
    submitted: Vec<String>,
    submit_attempts: usize,
    list_calls: usize,
    fail_submits: usize,
    fail_submits_after_accepting: usize,
    unit_lifetime: Option<usize>,
    active_at_submit: Vec<usize>,
    on_start: Option<UnitCallback>,
    on_finish: Option<UnitCallback>,
}

/// In-memory scheduler. Units start running on the first listing after their submission and
/// disappear after a configurable number of listings.
#[derive(Clone, Default)]
pub struct MockScheduler {
    state: Rc<RefCell<MockState>>,
}

impl MockScheduler {
    pub fn fail_next_submits(&self, count: usize) {
        self.state.borrow_mut().fail_submits = count;
    }

    pub fn fail_next_submits_after_accepting(&self, count: usize) {
        self.state.borrow_mut().fail_submits_after_accepting = count;
    }

    pub fn set_unit_lifetime(&self, listings: usize) {
        self.state.borrow_mut().unit_lifetime = Some(listings);
    }

    /// Called with the unit name when a unit starts running.
    pub fn on_unit_start<F: FnMut(&str) + 'static>(&self, callback: F) {
        self.state.borrow_mut().on_start = Some(Box::new(callback));
    }

    /// Called with the unit name when a unit disappears on its own.
    pub fn on_unit_finish<F: FnMut(&str) + 'static>(&self, callback: F) {
        self.state.borrow_mut().on_finish = Some(Box::new(callback));
    }

    pub fn set_running(&self, name: &str) {
        for unit in self
            .state
            .borrow_mut()
            .units
            .iter_mut()
            .filter(|unit| unit.name == name)
        {
            unit.state = UnitState::Running;
        }
    }

    pub fn submitted_names(&self) -> Vec<String> {
        self.state.borrow().submitted.clone()
    }

    pub fn submit_attempts(&self) -> usize {
        self.state.borrow().submit_attempts
    }

    pub fn list_calls(&self) -> usize {
        self.state.borrow().list_calls
    }

    /// Number of active units at the moment of each accepted submission.
    pub fn active_at_submit(&self) -> Vec<usize> {
        self.state.borrow().active_at_submit.clone()
    }

    pub fn active_ids(&self) -> Vec<UnitId> {
        self.state
            .borrow()
            .units
            .iter()
            .map(|unit| unit.id.clone())
            .collect()
    }

    pub fn active_names(&self) -> Vec<String> {
        self.state
            .borrow()
            .units
            .iter()
            .map(|unit| unit.name.clone())
            .collect()
    }

    pub fn units_with_prefix(&self, prefix: &str) -> Vec<ActiveUnit> {
        self.state
            .borrow()
            .units
            .iter()
            .filter(|unit| unit.name.starts_with(prefix))
            .map(|unit| ActiveUnit {
                id: unit.id.clone(),
                name: unit.name.clone(),
                state: unit.state,
            })
            .collect()
    }

    fn advance(&self) {
        let mut started = vec![];
        let mut finished = vec![];
        {
            let mut state = self.state.borrow_mut();
            state.list_calls += 1;
            for unit in state.units.iter_mut() {
                if unit.state == UnitState::Queued {
                    unit.state = UnitState::Running;
                    started.push(unit.name.clone());
                }
                if let Some(remaining) = unit.remaining.as_mut() {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        finished.push(unit.name.clone());
                    }
                }
            }
            state.units.retain(|unit| unit.remaining != Some(0));
        }
        self.notify(started, false);
        self.notify(finished, true);
    }

    fn notify(&self, names: Vec<String>, finish: bool) {
        if names.is_empty() {
            return;
        }
        let callback = {
            let mut state = self.state.borrow_mut();
            if finish {
                state.on_finish.take()
            } else {
                state.on_start.take()
            }
        };
        if let Some(mut callback) = callback {
            for name in &names {
                callback(name);
            }
            let mut state = self.state.borrow_mut();
            if finish {
                state.on_finish = Some(callback);
            } else {
                state.on_start = Some(callback);
            }
        }
    }
}

impl SchedulerAdapter for MockScheduler {
    fn submit(&self, _script: &Path, name: &str) -> SchedulerFuture<UnitId> {
        let state = self.state.clone();
        let name = name.to_string();

        Box::pin(async move {
            let mut state = state.borrow_mut();
            state.submit_attempts += 1;
            if state.fail_submits > 0 {
                state.fail_submits -= 1;
                anyhow::bail!("qsub: cannot connect to the server");
            }

            state.next_id += 1;
            let id = state.next_id.to_string();
            let active = state.units.len();
            let remaining = state.unit_lifetime;
            state.active_at_submit.push(active);
            state.submitted.push(name.clone());
            state.units.push(MockUnit {
                id: id.clone(),
                name,
                state: UnitState::Queued,
                remaining,
            });

            if state.fail_submits_after_accepting > 0 {
                state.fail_submits_after_accepting -= 1;
                anyhow::bail!("qsub: timeout while waiting for the reply");
            }
            Ok(id)
        })
    }

    fn list_active(&self, name_prefix: &str) -> SchedulerFuture<Vec<ActiveUnit>> {
        let scheduler = self.clone();
        let name_prefix = name_prefix.to_string();

        Box::pin(async move {
            scheduler.advance();
            Ok(scheduler.units_with_prefix(&name_prefix))
        })
    }

    fn delete(&self, ids: &[UnitId]) -> SchedulerFuture<()> {
        let state = self.state.clone();
        let ids = ids.to_vec();

        Box::pin(async move {
            state
                .borrow_mut()
                .units
                .retain(|unit| !ids.contains(&unit.id));
            Ok(())
        })
    }
}
