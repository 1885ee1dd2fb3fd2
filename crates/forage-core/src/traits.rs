use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::domain::CalendarEntry;
use crate::error::Result;
use crate::geo::{GeocodeHit, NearbyPlaces, NearbyQuery};
use crate::types::*;

/// LLM client: streaming chat completion with optional structured output.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        format: Option<&ResponseFormat>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Places/geocoding collaborator.
pub trait PlacesService: Send + Sync + 'static {
    /// Resolve a free-text query. `Ok(None)` means no match.
    fn geocode(&self, query: &str) -> BoxFuture<'_, Result<Option<GeocodeHit>>>;

    /// Points of interest around a coordinate.
    fn find_nearby(&self, query: NearbyQuery) -> BoxFuture<'_, Result<NearbyPlaces>>;
}

/// Calendar collaborator. Yields entries in source order.
pub trait CalendarSource: Send + Sync + 'static {
    /// Short description for logs (e.g. the file path).
    fn describe(&self) -> String;

    fn entries(&self) -> BoxFuture<'_, Result<Vec<CalendarEntry>>>;
}
