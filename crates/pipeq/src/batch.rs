use std::ops::Range;

use crate::model::Stage;

/// A contiguous range of jobs of one stage that is submitted as a single scheduler unit.
/// The jobs of a unit run sequentially inside one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchUnit {
    pub index: usize,
    pub jobs: Range<usize>,
}

impl BatchUnit {
    pub fn contains(&self, job_idx: usize) -> bool {
        self.jobs.contains(&job_idx)
    }
}

pub fn make_batches(job_count: usize, batch_size: usize) -> Vec<BatchUnit> {
    let batch_size = batch_size.max(1);
    (0..job_count.div_ceil(batch_size))
        .map(|index| BatchUnit {
            index,
            jobs: index * batch_size..job_count.min((index + 1) * batch_size),
        })
        .collect()
}

pub fn stage_batches(stage: &Stage) -> Vec<BatchUnit> {
    make_batches(stage.jobs.len(), stage.batch_size.max(1) as usize)
}

/// Index of the unit that runs `job_idx`.
pub fn unit_of_job(job_idx: usize, batch_size: u32) -> usize {
    job_idx / batch_size.max(1) as usize
}
