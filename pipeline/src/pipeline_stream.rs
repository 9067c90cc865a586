use async_fn_stream::{try_fn_stream, TryStreamEmitter};
use async_trait::async_trait;
use futures::Stream;

use crate::message::PipelineMessage;

/// A long running job that reports its progress as a stream of messages.
#[async_trait]
pub trait PipelineStream {
    async fn run(&mut self, emitter: TryStreamEmitter<PipelineMessage, anyhow::Error>) -> anyhow::Result<()>;

    fn launch(&mut self) -> impl Stream<Item = Result<PipelineMessage, anyhow::Error>> {
        try_fn_stream(|emitter| async move {
            self.run(emitter).await?;
            Ok(())
        })
    }
}
