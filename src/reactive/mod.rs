pub mod engine;
pub mod query;
pub mod subscription;

pub use engine::QueryEngine;
pub use query::{QueryData, QueryNotification, QueryOption, QueryResultChange, ReactiveQuery};
pub use subscription::{SubscriberSet, Subscription, SubscriptionId};
