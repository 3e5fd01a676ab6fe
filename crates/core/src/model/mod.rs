mod attempt;
mod ids;
mod stat;

pub use attempt::{AttemptError, AttemptRecord, ResultItem};
pub use ids::{AttemptId, ParseIdError, QuestionId};
pub use stat::{QuestionStat, StatDelta, StatError};
