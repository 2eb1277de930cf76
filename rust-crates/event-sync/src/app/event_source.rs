use crate::{
    Result,
    events::{
        EventsSinceResponse,
        NetworkComponentUpdate,
        StreamResponse,
    },
};
use futures::stream::BoxStream;

pub type ResponseStream = BoxStream<'static, Result<StreamResponse>>;

/// The indexing service: a live push feed plus catch-up queries.
pub trait StreamService: Send + Sync + 'static {
    fn subscribe(&self) -> impl Future<Output = Result<ResponseStream>> + Send;

    fn events_since(
        &self,
        since_block: u64,
    ) -> impl Future<Output = Result<EventsSinceResponse>> + Send;
}

/// Direct chain log access, used when the indexing service cannot fill a gap.
pub trait ChainLogSource: Send + Sync + 'static {
    fn latest_block(&self) -> impl Future<Output = Result<u64>> + Send;

    fn fetch_world_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> impl Future<Output = Result<Vec<NetworkComponentUpdate>>> + Send;
}
