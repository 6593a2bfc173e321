pub mod broker;
pub mod topic;
pub mod wire;

pub use broker::{Frame, StreamBroker, Subscriber};
pub use topic::StreamTopic;
pub use wire::{StreamQuery, encode_frame};
