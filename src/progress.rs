use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProgressScope {
    Run,
    Target { key: String, label: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressStage {
    Queue,
    Generate,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub scope: ProgressScope,
    pub stage: ProgressStage,
    pub current: u64,
    pub total: u64,
    pub status: String,
    pub finished: bool,
}

impl ProgressStage {
    pub fn label(&self) -> &'static str {
        match self {
            ProgressStage::Queue => "queue",
            ProgressStage::Generate => "generate",
            ProgressStage::Done => "done",
            ProgressStage::Failed => "failed",
        }
    }
}

impl fmt::Display for ProgressScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressScope::Run => write!(f, "overall"),
            ProgressScope::Target { label, .. } => write!(f, "{label}"),
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {} {}: {}",
            self.current,
            self.total,
            self.scope,
            self.stage.label(),
            self.status
        )
    }
}
