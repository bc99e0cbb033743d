//! Position updates: `POSITION_UPDATE`, video id, position, sample time.

use lockstep_core::{PositionSample, TransportError};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::WireStream;
use crate::token::POSITION_UPDATE;

pub async fn write_sample<S>(wire: &mut WireStream<S>, sample: &PositionSample) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    wire.write_string(POSITION_UPDATE).await?;
    wire.write_string(&sample.video_id).await?;
    wire.write_i64(sample.position_millis).await?;
    wire.write_i64(sample.sampled_at_epoch_millis).await
}

/// Read the fields following a `POSITION_UPDATE` tag.
pub async fn read_sample_body<S>(wire: &mut WireStream<S>) -> Result<PositionSample, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let video_id = wire.read_string().await?;
    let position_millis = wire.read_i64().await?;
    let sampled_at_epoch_millis = wire.read_i64().await?;
    Ok(PositionSample {
        video_id,
        position_millis,
        sampled_at_epoch_millis,
    })
}
