pub mod config;
pub mod early_stopping;
pub mod metrics;
pub mod progress;
pub mod schedule;
pub mod state;
pub mod trainer;

pub use config::TrainingConfig;
pub use early_stopping::{EarlyStopping, Verdict};
pub use metrics::{match_ground_truth, EpochAccumulator, EpochMetrics, MatchCount};
pub use progress::ProgressMarkers;
pub use schedule::WarmupSchedule;
pub use state::{EpochRecord, TrainingState};
pub use trainer::Trainer;
