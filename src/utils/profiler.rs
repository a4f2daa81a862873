use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTiming {
    pub name: &'static str,
    pub duration: Duration,
}

/// Wall-clock time per named phase, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct Profiler {
    phases: Vec<PhaseTiming>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` and charges its duration to `name`.
    pub fn record_phase<T>(&mut self, name: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.add(name, start.elapsed());
        result
    }

    /// Adds `duration` to the running total of `name`.
    pub fn add(&mut self, name: &'static str, duration: Duration) {
        match self.phases.iter_mut().find(|phase| phase.name == name) {
            Some(phase) => phase.duration += duration,
            None => self.phases.push(PhaseTiming { name, duration }),
        }
    }

    pub fn phases(&self) -> &[PhaseTiming] {
        &self.phases
    }

    pub fn get(&self, name: &str) -> Option<Duration> {
        self.phases
            .iter()
            .find(|phase| phase.name == name)
            .map(|phase| phase.duration)
    }

    pub fn total(&self) -> Duration {
        self.phases.iter().map(|phase| phase.duration).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_accumulate_in_first_seen_order() {
        let mut profiler = Profiler::new();
        profiler.add("lifting", Duration::from_millis(2));
        profiler.add("codegen", Duration::from_millis(5));
        profiler.add("lifting", Duration::from_millis(3));

        let names: Vec<_> = profiler.phases().iter().map(|phase| phase.name).collect();
        assert_eq!(names, ["lifting", "codegen"]);
        assert_eq!(profiler.get("lifting"), Some(Duration::from_millis(5)));
        assert_eq!(profiler.get("optimization"), None);
        assert_eq!(profiler.total(), Duration::from_millis(10));
    }

    #[test]
    fn record_phase_returns_the_closure_result() {
        let mut profiler = Profiler::new();
        let value = profiler.record_phase("predecode", || 41 + 1);
        assert_eq!(value, 42);
        assert!(profiler.get("predecode").is_some());
    }
}
