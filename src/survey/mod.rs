//! Satisfaction surveys: state machine, persistence model, reply handling
//! and the timeout sweeps.

pub mod lifecycle;
pub mod model;
pub mod reply;
pub mod state;
pub mod sweeper;

pub use lifecycle::{SurveyReplyOutcome, SurveyService};
pub use model::SatisfactionSurvey;
pub use state::{Rating, SurveyEvent, SurveyStatus};
pub use sweeper::{SurveySweeper, spawn_sweepers};
