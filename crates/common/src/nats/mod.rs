mod client;
mod consumer;
mod consumer_types;
mod insight_notifier;
mod object_store;
mod traits;

pub use client::{
    NatsClient, NatsCorePublisher, NatsJetStreamConsumer, NatsJetStreamPublisher, NatsPullConsumer,
};
pub use consumer::NatsConsumer;
pub use consumer_types::{ConsumeRequest, ConsumeResponse};
pub use insight_notifier::NatsInsightNotifier;
pub use object_store::NatsPhotoStore;
pub use traits::{CorePublisher, JetStreamConsumer, JetStreamPublisher, PullConsumer};

#[cfg(any(test, feature = "testing"))]
pub use traits::{
    MockCorePublisher, MockJetStreamConsumer, MockJetStreamPublisher, MockPullConsumer,
};
