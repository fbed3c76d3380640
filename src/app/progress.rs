use std::sync::mpsc::Sender;

use serde::Serialize;

use crate::rerank::RerankResult;

/// Status of one query, emitted in order and closed by `Finished` or `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { target: String },
    IndexReady { chunks: usize },
    Candidates { count: usize },
    Reranking { candidates: usize },
    Finished { result: RerankResult },
    Failed { reason: String },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Finished { .. } | ProgressEvent::Failed { .. })
    }
}

/// Optional event sink; a dropped receiver is ignored.
#[derive(Clone, Copy)]
pub(crate) struct Progress<'a>(pub Option<&'a Sender<ProgressEvent>>);

impl Progress<'_> {
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(sink) = self.0 {
            let _ = sink.send(event);
        }
    }
}
