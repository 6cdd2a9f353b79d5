mod record;
mod spec;

pub use record::{Failure, FailureKind, FeedRecord, FeedState, FeedStatus};
pub use spec::{
    default_target_context, ConfigVersion, FeedSet, FeedSpec, OperationMode, RestartPolicy,
    DEFAULT_POLLING_INTERVAL,
};
