use crate::model::Experiment;

/// Called after every poll tick of a running experiment, typically to re-render its report.
pub trait TickObserver {
    fn on_tick(&mut self, experiment: &Experiment) -> crate::Result<()>;
}

impl<F> TickObserver for F
where
    F: FnMut(&Experiment) -> crate::Result<()>,
{
    fn on_tick(&mut self, experiment: &Experiment) -> crate::Result<()> {
        self(experiment)
    }
}
