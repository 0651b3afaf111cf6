use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;

/// Downstream handler that counts how often it was reached.
#[derive(Clone, Default)]
pub struct Upstream {
    hits: Arc<AtomicUsize>,
}

impl Upstream {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Answers every path with `202` and a fixed body and header.
    pub fn router(&self) -> Router {
        let hits = self.hits.clone();
        let handler = move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (
                    StatusCode::ACCEPTED,
                    [("x-upstream", "yes")],
                    "upstream body",
                )
                    .into_response()
            }
        };
        Router::new().fallback(handler)
    }
}
