pub mod broker;
pub mod stream_store;

pub use broker::{BrokerError, Producer, StreamBroker, StreamEvent, StreamStatus};
pub use stream_store::{
    InMemoryStreamStore, SqliteStreamStore, StreamHandle, StreamStore, StreamStoreError,
    StreamStoreResult,
};
