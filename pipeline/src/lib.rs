pub mod config;
pub mod error;
pub mod heatmap;
pub mod infer_stream;
pub mod message;
pub mod pipeline_stream;
pub mod slice_stream;
pub mod train_stream;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use infer_stream::{predict, InferStream};
pub use message::PipelineMessage;
pub use pipeline_stream::PipelineStream;
pub use slice_stream::SliceStream;
pub use train_stream::TrainStream;
