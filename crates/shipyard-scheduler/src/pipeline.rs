//! The ordered list of jobs every build goes through.

use std::fmt;

/// One stage of the build pipeline.
///
/// Variants are declared in execution order; the numeric prefix of the
/// name mirrors that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {
    /// Report pending, check the tree out and select modules. No process.
    Init,
    /// Install and test the `base` module on a fresh database.
    TestBase,
    /// Install and test every selected module, optionally under coverage.
    TestAll,
    /// HTML coverage report when the branch asks for coverage.
    Coverage,
    /// Judge the result, then serve the build until it is retired.
    Run,
}

/// Static description of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDescriptor {
    pub job: Job,
    pub name: &'static str,
    /// CPU seconds granted to the job's process.
    pub cpu_limit: Option<u64>,
}

pub const PIPELINE: [JobDescriptor; 5] = [
    JobDescriptor {
        job: Job::Init,
        name: "job_00_init",
        cpu_limit: None,
    },
    JobDescriptor {
        job: Job::TestBase,
        name: "job_10_test_base",
        cpu_limit: Some(300),
    },
    JobDescriptor {
        job: Job::TestAll,
        name: "job_20_test_all",
        cpu_limit: Some(2100),
    },
    JobDescriptor {
        job: Job::Coverage,
        name: "job_21_coverage",
        cpu_limit: None,
    },
    JobDescriptor {
        job: Job::Run,
        name: "job_30_run",
        cpu_limit: None,
    },
];

impl Job {
    fn index(self) -> usize {
        PIPELINE
            .iter()
            .position(|d| d.job == self)
            .unwrap_or(PIPELINE.len() - 1)
    }

    pub fn descriptor(self) -> &'static JobDescriptor {
        &PIPELINE[self.index()]
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    pub fn cpu_limit(self) -> Option<u64> {
        self.descriptor().cpu_limit
    }

    pub fn first() -> Job {
        PIPELINE[0].job
    }

    pub fn last() -> Job {
        PIPELINE[PIPELINE.len() - 1].job
    }

    pub fn is_last(self) -> bool {
        self == Job::last()
    }

    /// The last test job; finishing it makes the build `running`.
    pub fn is_last_test(self) -> bool {
        self.index() + 2 == PIPELINE.len()
    }

    pub fn next(self) -> Option<Job> {
        PIPELINE.get(self.index() + 1).map(|d| d.job)
    }

    pub fn from_name(name: &str) -> Option<Job> {
        PIPELINE.iter().find(|d| d.name == name).map(|d| d.job)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a job handler started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// A supervised process; the job ends when its lock is released.
    Spawned(i32),
    /// Nothing to wait for; advance the build again right away.
    NoProcess,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_order() {
        let mut names: Vec<&str> = PIPELINE.iter().map(|d| d.name).collect();
        let declared = names.clone();
        names.sort();
        assert_eq!(names, declared);

        assert_eq!(Job::first(), Job::Init);
        assert_eq!(Job::last(), Job::Run);
        assert!(Job::Coverage.is_last_test());
        assert!(!Job::TestAll.is_last_test());
        assert_eq!(Job::TestBase.next(), Some(Job::TestAll));
        assert_eq!(Job::Run.next(), None);
    }

    #[test]
    fn test_job_names() {
        assert_eq!(Job::from_name("job_20_test_all"), Some(Job::TestAll));
        assert_eq!(Job::from_name("job_99_unknown"), None);
        assert_eq!(Job::TestBase.cpu_limit(), Some(300));
        assert_eq!(Job::TestAll.cpu_limit(), Some(2100));
        assert_eq!(Job::Run.to_string(), "job_30_run");
    }
}
