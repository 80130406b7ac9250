use serde::Serialize;

/// Which trigger produced a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    #[default]
    Manual,
    Scheduled,
}

impl RunType {
    pub fn as_str(self) -> &'static str {
        match self {
            RunType::Manual => "manual",
            RunType::Scheduled => "scheduled",
        }
    }
}

/// Pipeline progress. Declaration order is execution order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    #[default]
    Idle,
    TailStart,
    SchedulerScript,
    TailStop,
    SdvnScript,
    LocalScript,
    Complete,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Idle => "idle",
            Step::TailStart => "tail_start",
            Step::SchedulerScript => "scheduler_script",
            Step::TailStop => "tail_stop",
            Step::SdvnScript => "sdvn_script",
            Step::LocalScript => "local_script",
            Step::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub scheduler_output: String,
    pub sdvn_output: String,
    pub local_output: String,
    pub error_message: String,
    pub run_type: RunType,
    pub running: bool,
    pub step: Step,
}

impl JobResult {
    pub fn new(run_type: RunType) -> Self {
        Self {
            run_type,
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error_message.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub running: bool,
    pub activity: String,
    pub step: Step,
}
