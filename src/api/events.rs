use std::convert::Infallible;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use ulid::Ulid;

use super::ApiError;
use super::dto::ChangeDto;
use super::extract::{ApiPath, Tenant};

/// Server-sent change feed for one service. Lagged receivers skip what they
/// missed; the stream ends when the service is removed.
pub async fn stream(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    engine.get_service(id).await?;
    let rx = engine.notify.subscribe(id);

    let stream = BroadcastStream::new(rx).filter_map(|msg| {
        let change = msg.ok()?;
        SseEvent::default()
            .event(change.kind.as_str())
            .json_data(ChangeDto::from(&change))
            .ok()
            .map(Ok::<_, Infallible>)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
