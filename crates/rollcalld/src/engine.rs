use image::GrayImage;
use rollcall_core::{DetectorBackbone, EncodingExtractor, ExtractError, GalleryStore, MatchResult, Matcher};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the recognition loop to the engine thread.
enum EngineRequest {
    Recognize {
        frame: GrayImage,
        reply: oneshot::Sender<Result<Vec<MatchResult>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Detect every face in `frame` and match each against the serving gallery.
    ///
    /// Results come back in detection order; an empty vector means no face.
    pub async fn recognize(&self, frame: GrayImage) -> Result<Vec<MatchResult>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize { frame, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Inference is blocking and stateful, so it stays off the async runtime.
/// Each request matches against the gallery snapshot current when it is
/// picked up; a reload swaps the snapshot between requests, never during one.
pub fn spawn_engine<E, M>(
    mut extractor: E,
    matcher: M,
    store: Arc<GalleryStore>,
    backbone: DetectorBackbone,
) -> Result<EngineHandle, EngineError>
where
    E: EncodingExtractor + 'static,
    M: Matcher + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(%backbone, "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { frame, reply } => {
                        let result = run_recognize(&mut extractor, &matcher, &store, backbone, &frame);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn run_recognize<E: EncodingExtractor, M: Matcher>(
    extractor: &mut E,
    matcher: &M,
    store: &GalleryStore,
    backbone: DetectorBackbone,
    frame: &GrayImage,
) -> Result<Vec<MatchResult>, EngineError> {
    let faces = extractor.extract(frame, backbone)?;
    if faces.is_empty() {
        return Ok(Vec::new());
    }
    let gallery = store.current();
    let results = matcher.compare_all(&faces, &gallery);
    tracing::debug!(
        faces = results.len(),
        accepted = results.iter().filter(|r| r.is_accepted()).count(),
        gallery_version = gallery.version,
        "frame recognised"
    );
    Ok(results)
}
